//! In-memory sliding-window rate limiting for the API surface.
//!
//! Ported from `rate_limiter.py`: a bucket keyed by `"{key}:{endpoint_type}"`
//! holding request timestamps, trimmed to the current window on each check.
//! No external store — the daemon is single-process, so an in-memory map
//! behind a mutex is sufficient and matches the original's scope (it never
//! shared state across processes either).

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// The endpoint class a request is rate-limited under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// High-volume heartbeat ingestion endpoints.
    Heartbeat,
    /// Lower-volume management/admin endpoints.
    Management,
}

/// Path prefixes that bypass rate limiting (and auth) entirely: health
/// probes, metrics scraping, and docs hosting.
const BYPASS_PREFIXES: [&str; 4] = ["/health", "/v1/healthcheck", "/metrics", "/docs"];

/// Path prefixes classified as high-volume heartbeat ingestion.
const HEARTBEAT_PREFIXES: [&str; 3] = ["/heartbeat", "/v1/heartbeat", "/v2/heartbeat"];

impl EndpointClass {
    /// Classify a request path by prefix: `/heartbeat`, `/v1/heartbeat`, and
    /// `/v2/heartbeat` are high-volume, everything else is management.
    pub fn classify(path: &str) -> Self {
        if HEARTBEAT_PREFIXES.iter().any(|p| path.starts_with(p)) {
            Self::Heartbeat
        } else {
            Self::Management
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Management => "management",
        }
    }
}

/// Whether `path` bypasses rate limiting (and auth) entirely: health
/// probes, metrics scraping, and docs hosting.
pub fn bypasses_rate_limit(path: &str) -> bool {
    BYPASS_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Per-class rate limit configuration.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_secs: i64,
}

/// Sliding-window limiter over `(key, endpoint_class)` buckets.
pub struct RateLimiter {
    heartbeat_rule: RateLimitRule,
    management_rule: RateLimitRule,
    overrides: HashMap<String, RateLimitRule>,
    bypass_keys: Vec<String>,
    buckets: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest request in the current window falls out of it,
    /// freeing up a slot. `None` for bypassed keys, which never fill up.
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimiter {
    /// Build a limiter from the configured heartbeat/management defaults.
    pub fn new(heartbeat_rule: RateLimitRule, management_rule: RateLimitRule) -> Self {
        Self {
            heartbeat_rule,
            management_rule,
            overrides: HashMap::new(),
            bypass_keys: Vec::new(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Register a per-key override rule, e.g. for an API key with a
    /// `custom_rate_limit`.
    pub fn set_override(&mut self, key: &str, rule: RateLimitRule) {
        self.overrides.insert(key.to_owned(), rule);
    }

    /// Exempt a key from rate limiting entirely.
    pub fn set_bypass(&mut self, key: &str) {
        self.bypass_keys.push(key.to_owned());
    }

    fn rule_for(&self, key: &str, class: EndpointClass) -> RateLimitRule {
        if let Some(rule) = self.overrides.get(key) {
            return *rule;
        }
        match class {
            EndpointClass::Heartbeat => self.heartbeat_rule,
            EndpointClass::Management => self.management_rule,
        }
    }

    /// Check and record a request for `key` under `class` at `now`.
    pub fn check(&self, key: &str, class: EndpointClass, now: DateTime<Utc>) -> RateLimitDecision {
        if self.bypass_keys.iter().any(|k| k == key) {
            return RateLimitDecision {
                allowed: true,
                limit: u32::MAX,
                remaining: u32::MAX,
                reset_at: None,
            };
        }

        let rule = self.rule_for(key, class);
        let bucket_key = format!("{key}:{}", class.as_str());
        let window_start = now - chrono::Duration::seconds(rule.window_secs);

        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let entry = buckets.entry(bucket_key).or_default();
        entry.retain(|t| *t > window_start);

        let reset_at = entry.first().map(|oldest| *oldest + chrono::Duration::seconds(rule.window_secs));

        if entry.len() >= rule.limit as usize {
            return RateLimitDecision {
                allowed: false,
                limit: rule.limit,
                remaining: 0,
                reset_at,
            };
        }

        entry.push(now);
        RateLimitDecision {
            allowed: true,
            limit: rule.limit,
            remaining: rule.limit - entry.len() as u32,
            reset_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(limit: u32, window_secs: i64) -> RateLimitRule {
        RateLimitRule { limit, window_secs }
    }

    #[test]
    fn classifies_by_path_prefix() {
        assert_eq!(EndpointClass::classify("/heartbeat/foo"), EndpointClass::Heartbeat);
        assert_eq!(EndpointClass::classify("/v1/heartbeat/foo"), EndpointClass::Heartbeat);
        assert_eq!(EndpointClass::classify("/v2/heartbeat/123/start"), EndpointClass::Heartbeat);
        assert_eq!(EndpointClass::classify("/api/services"), EndpointClass::Management);
        assert_eq!(EndpointClass::classify("/v2/snapshots"), EndpointClass::Management);
    }

    #[test]
    fn recognizes_bypass_paths() {
        assert!(bypasses_rate_limit("/health"));
        assert!(bypasses_rate_limit("/health/live"));
        assert!(bypasses_rate_limit("/v1/healthcheck"));
        assert!(bypasses_rate_limit("/metrics"));
        assert!(bypasses_rate_limit("/docs/swagger.json"));
        assert!(!bypasses_rate_limit("/heartbeat"));
        assert!(!bypasses_rate_limit("/api/services"));
    }

    #[test]
    fn allows_up_to_limit_then_blocks() {
        let limiter = RateLimiter::new(rule(2, 60), rule(20, 60));
        let now = Utc::now();
        assert!(limiter.check("svc-a", EndpointClass::Heartbeat, now).allowed);
        assert!(limiter.check("svc-a", EndpointClass::Heartbeat, now).allowed);
        let decision = limiter.check("svc-a", EndpointClass::Heartbeat, now);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn window_slides_forward() {
        let limiter = RateLimiter::new(rule(1, 60), rule(20, 60));
        let now = Utc::now();
        assert!(limiter.check("svc-a", EndpointClass::Heartbeat, now).allowed);
        assert!(!limiter.check("svc-a", EndpointClass::Heartbeat, now).allowed);
        let later = now + chrono::Duration::seconds(61);
        assert!(limiter.check("svc-a", EndpointClass::Heartbeat, later).allowed);
    }

    #[test]
    fn bypass_key_is_never_limited() {
        let mut limiter = RateLimiter::new(rule(1, 60), rule(1, 60));
        limiter.set_bypass("internal");
        let now = Utc::now();
        for _ in 0..10 {
            assert!(limiter.check("internal", EndpointClass::Heartbeat, now).allowed);
        }
    }

    #[test]
    fn per_key_override_replaces_default() {
        let mut limiter = RateLimiter::new(rule(1, 60), rule(1, 60));
        limiter.set_override("vip", rule(5, 60));
        let now = Utc::now();
        for _ in 0..5 {
            assert!(limiter.check("vip", EndpointClass::Management, now).allowed);
        }
        assert!(!limiter.check("vip", EndpointClass::Management, now).allowed);
    }
}
