//! SSRF guard for outbound webhook URLs.
//!
//! Ported from `url_validator.py`: a literal host blocklist, CIDR
//! blocklists for private/link-local/loopback ranges, and a DNS-resolution
//! check so a permitted hostname that resolves to a blocked address is
//! still rejected. An operator-configured allowlist skips DNS entirely.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::lookup_host;
use url::Url;

const DNS_TIMEOUT: Duration = Duration::from_secs(5);

const LITERAL_HOST_BLOCKLIST: &[&str] = &[
    "0.0.0.0",
    "127.0.0.1",
    "localhost",
    "169.254.169.254",
    "metadata.google.internal",
    "metadata",
];

/// IPv4 CIDR ranges that may never be contacted.
const IPV4_CIDR_BLOCKLIST: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(0, 0, 0, 0), 8),
];

/// IPv6 CIDR ranges that may never be contacted.
const IPV6_CIDR_BLOCKLIST: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::LOCALHOST, 128),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
    (Ipv6Addr::UNSPECIFIED, 128),
];

/// Environment variable naming a comma-separated allowlist of hostnames
/// exempt from DNS-resolution checks (but not from scheme/literal checks).
pub const ALLOWED_HOSTS_ENV: &str = "MEDIC_ALLOWED_WEBHOOK_HOSTS";

/// Reasons a URL is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("url must use http or https scheme")]
    BadScheme,
    #[error("url has no host")]
    NoHost,
    #[error("host '{0}' is on the blocklist")]
    BlockedHost(String),
    #[error("host '{0}' resolves to blocked address {1}")]
    BlockedAddress(String, IpAddr),
    #[error("dns resolution failed for host '{0}': {1}")]
    ResolutionFailed(String, String),
    #[error("dns resolution timed out for host '{0}'")]
    ResolutionTimedOut(String),
}

fn ipv4_in_cidr(addr: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    (u32::from(addr) & mask) == (u32::from(network) & mask)
}

fn ipv6_in_cidr(addr: Ipv6Addr, network: Ipv6Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
    (u128::from(addr) & mask) == (u128::from(network) & mask)
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => IPV4_CIDR_BLOCKLIST
            .iter()
            .any(|&(net, prefix)| ipv4_in_cidr(v4, net, prefix)),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_ip(IpAddr::V4(mapped));
            }
            IPV6_CIDR_BLOCKLIST
                .iter()
                .any(|&(net, prefix)| ipv6_in_cidr(v6, net, prefix))
        }
    }
}

/// Validates outbound webhook URLs against the SSRF blocklist.
pub struct UrlValidator {
    allowed_hosts: Vec<String>,
}

impl UrlValidator {
    /// Build a validator, reading the allowlist from `env`.
    pub fn from_env(env: impl Fn(&str) -> Option<String>) -> Self {
        let allowed_hosts = env(ALLOWED_HOSTS_ENV)
            .map(|raw| {
                raw.split(',')
                    .map(|h| h.trim().to_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self { allowed_hosts }
    }

    /// A validator with no allowlist entries.
    pub fn new() -> Self {
        Self {
            allowed_hosts: Vec::new(),
        }
    }

    /// Validate a URL: scheme, literal host blocklist, then (unless
    /// allowlisted) DNS resolution against the CIDR blocklists.
    pub async fn validate(&self, raw_url: &str) -> Result<(), ValidationError> {
        let url = Url::parse(raw_url).map_err(|_| ValidationError::NoHost)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ValidationError::BadScheme);
        }
        let host = url.host_str().ok_or(ValidationError::NoHost)?.to_lowercase();

        if LITERAL_HOST_BLOCKLIST.contains(&host.as_str()) {
            return Err(ValidationError::BlockedHost(host));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_blocked_ip(ip) {
                return Err(ValidationError::BlockedAddress(host, ip));
            }
        }

        if self.allowed_hosts.contains(&host) {
            return Ok(());
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let lookup = tokio::time::timeout(DNS_TIMEOUT, lookup_host((host.as_str(), port)))
            .await
            .map_err(|_| ValidationError::ResolutionTimedOut(host.clone()))?
            .map_err(|e| ValidationError::ResolutionFailed(host.clone(), e.to_string()))?;

        for addr in lookup {
            let ip = socket_ip(addr);
            if is_blocked_ip(ip) {
                return Err(ValidationError::BlockedAddress(host, ip));
            }
        }

        Ok(())
    }
}

impl Default for UrlValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn socket_ip(addr: SocketAddr) -> IpAddr {
    addr.ip()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_literal_localhost() {
        let v = UrlValidator::new();
        assert_eq!(
            v.validate("http://localhost/hook").await,
            Err(ValidationError::BlockedHost("localhost".to_owned()))
        );
    }

    #[tokio::test]
    async fn rejects_metadata_ip_literal() {
        let v = UrlValidator::new();
        let result = v.validate("http://169.254.169.254/latest/meta-data").await;
        assert!(matches!(result, Err(ValidationError::BlockedAddress(_, _))));
    }

    #[tokio::test]
    async fn rejects_bad_scheme() {
        let v = UrlValidator::new();
        assert_eq!(
            v.validate("ftp://example.com/hook").await,
            Err(ValidationError::BadScheme)
        );
    }

    #[tokio::test]
    async fn rejects_private_ipv4_literal() {
        let v = UrlValidator::new();
        let result = v.validate("http://10.1.2.3/hook").await;
        assert!(matches!(result, Err(ValidationError::BlockedAddress(_, _))));
    }

    #[test]
    fn cidr_matching_handles_boundary() {
        assert!(ipv4_in_cidr(
            Ipv4Addr::new(192, 168, 255, 255),
            Ipv4Addr::new(192, 168, 0, 0),
            16
        ));
        assert!(!ipv4_in_cidr(
            Ipv4Addr::new(192, 169, 0, 1),
            Ipv4Addr::new(192, 168, 0, 0),
            16
        ));
    }
}
