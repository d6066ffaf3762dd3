//! Matches a service's consecutive-failure count against configured
//! playbook triggers and admits the match through the circuit breaker.
//!
//! Ported from the alert/playbook integration layer (`playbook_alert_integration.py`):
//! on every qualifying monitor-loop cycle, find the most specific trigger
//! whose `service_pattern` matches the service name and whose
//! `consecutive_failures` threshold has been reached, then start a
//! playbook execution if the circuit breaker admits it.

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use crate::circuit_breaker::{self, CircuitBreakerConfig};
use crate::playbook::{self, EngineError, StartOptions};
use crate::store::models::PlaybookTrigger;
use crate::store::{Store, StoreError};

/// Outcome of evaluating triggers for a service's alert cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// No configured trigger matched the service at this failure count.
    NoMatch,
    /// A trigger matched but the circuit breaker rejected the execution.
    CircuitBreakerOpen {
        trigger_id: i64,
        message: String,
    },
    /// A playbook execution was started.
    Started {
        trigger_id: i64,
        execution_id: i64,
    },
}

/// Errors from trigger evaluation (distinct from a non-matching no-op).
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Translate a trigger's `service_pattern` into a regex. Patterns
/// containing glob metacharacters (`*`, `?`) are treated as globs and
/// anchored; anything else is treated as a literal regex, matching the
/// original's "glob or regex" flexibility.
fn pattern_to_regex(pattern: &str) -> Option<Regex> {
    if pattern.contains('*') || pattern.contains('?') {
        let mut anchored = String::from("^");
        for segment in pattern.split_inclusive(['*', '?']) {
            let (literal, wildcard) = match segment.chars().last() {
                Some('*') => (&segment[..segment.len() - 1], Some(".*")),
                Some('?') => (&segment[..segment.len() - 1], Some(".")),
                _ => (segment, None),
            };
            anchored.push_str(&Regex::escape(literal));
            if let Some(w) = wildcard {
                anchored.push_str(w);
            }
        }
        anchored.push('$');
        Regex::new(&anchored).ok()
    } else {
        Regex::new(pattern).ok()
    }
}

/// Select the most specific trigger matching `service_name` at
/// `consecutive_failures`: the largest `consecutive_failures` not
/// exceeding the observed count, tie-broken by lowest id.
fn select_trigger<'a>(
    triggers: &'a [PlaybookTrigger],
    service_name: &str,
    consecutive_failures: i64,
) -> Option<&'a PlaybookTrigger> {
    triggers
        .iter()
        .filter(|t| t.consecutive_failures <= consecutive_failures)
        .filter(|t| {
            pattern_to_regex(&t.service_pattern)
                .is_some_and(|re| re.is_match(service_name))
        })
        .max_by(|a, b| {
            a.consecutive_failures
                .cmp(&b.consecutive_failures)
                .then(b.id.cmp(&a.id))
        })
}

/// Evaluate triggers for a service's current alert cycle and, if a match
/// is admitted, start the corresponding playbook execution.
pub async fn evaluate(
    store: &Store,
    circuit_breaker_config: CircuitBreakerConfig,
    service_id: i64,
    service_name: &str,
    alert_id: i64,
    consecutive_failures: i64,
    now: DateTime<Utc>,
) -> Result<TriggerOutcome, TriggerError> {
    let triggers = store.all_playbook_triggers().await?;
    let Some(trigger) = select_trigger(&triggers, service_name, consecutive_failures) else {
        return Ok(TriggerOutcome::NoMatch);
    };

    let status = circuit_breaker::check(store, circuit_breaker_config, service_id, now).await?;
    if !status.allowed {
        return Ok(TriggerOutcome::CircuitBreakerOpen {
            trigger_id: trigger.id,
            message: status.message,
        });
    }

    let execution_id = playbook::start_execution(
        store,
        trigger.playbook_id,
        StartOptions {
            service_id: Some(service_id),
            alert_id: Some(alert_id),
            consecutive_failures: Some(consecutive_failures),
            trigger_id: Some(trigger.id),
            extra_context: None,
        },
        now,
    )
    .await?;

    Ok(TriggerOutcome::Started {
        trigger_id: trigger.id,
        execution_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(id: i64, playbook_id: i64, pattern: &str, consecutive_failures: i64) -> PlaybookTrigger {
        PlaybookTrigger {
            id,
            playbook_id,
            service_pattern: pattern.to_owned(),
            consecutive_failures,
        }
    }

    #[test]
    fn glob_pattern_matches_prefix() {
        let triggers = vec![trigger(1, 1, "worker-*", 1)];
        assert!(select_trigger(&triggers, "worker-ingest", 1).is_some());
        assert!(select_trigger(&triggers, "other-service", 1).is_none());
    }

    #[test]
    fn picks_most_specific_threshold() {
        let triggers = vec![trigger(1, 1, "worker-*", 1), trigger(2, 2, "worker-*", 3)];
        let picked = select_trigger(&triggers, "worker-ingest", 5).expect("match");
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn ties_broken_by_lowest_id() {
        let triggers = vec![trigger(5, 1, "worker-*", 2), trigger(2, 2, "worker-*", 2)];
        let picked = select_trigger(&triggers, "worker-ingest", 2).expect("match");
        assert_eq!(picked.id, 2);
    }

    #[test]
    fn threshold_not_yet_reached_excludes_trigger() {
        let triggers = vec![trigger(1, 1, "worker-*", 5)];
        assert!(select_trigger(&triggers, "worker-ingest", 3).is_none());
    }
}
