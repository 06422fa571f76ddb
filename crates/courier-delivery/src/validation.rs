//! URL and event-type validation for subscriptions.
//!
//! Subscription URLs must be http(s) and every address the host resolves
//! to must be public. Loopback, private, link-local, CGNAT, multicast and
//! similar ranges are rejected, as are well-known internal host names and
//! hosts that fail to resolve.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
};

use async_trait::async_trait;
use url::Url;

use crate::error::RegistryError;

/// Event types subscribers can register for.
pub const SUPPORTED_EVENTS: &[&str] = &["clip.submitted", "clip.approved", "clip.rejected"];

/// Maximum number of event types per subscription.
pub const MAX_EVENTS_PER_SUBSCRIPTION: usize = 10;

/// Maximum accepted URL length.
pub const MAX_URL_LENGTH: usize = 2048;

/// Maximum accepted description length.
pub const MAX_DESCRIPTION_LENGTH: usize = 500;

/// Resolves host names to addresses.
#[async_trait]
pub trait Resolver: Send + Sync + fmt::Debug {
    /// Returns every address `host` resolves to.
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system via `tokio::net::lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Validates subscription URLs against internal address ranges.
#[derive(Debug, Clone)]
pub struct UrlValidator {
    resolver: Arc<dyn Resolver>,
}

impl UrlValidator {
    /// Creates a validator using `resolver` for DNS lookups.
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    /// Creates a validator using the system resolver.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemResolver))
    }

    /// Parses and validates a subscription URL.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidUrl` if the URL is malformed, not
    /// http(s), names an internal host, fails to resolve, or resolves to
    /// any non-public address.
    pub async fn validate(&self, raw: &str) -> Result<Url, RegistryError> {
        if raw.len() > MAX_URL_LENGTH {
            return Err(RegistryError::InvalidUrl(format!(
                "url exceeds {MAX_URL_LENGTH} characters"
            )));
        }

        let url = Url::parse(raw).map_err(|e| RegistryError::InvalidUrl(format!("{raw}: {e}")))?;

        match url.scheme() {
            "http" | "https" => {},
            scheme => {
                return Err(RegistryError::InvalidUrl(format!("unsupported scheme {scheme}")));
            },
        }

        let host = url
            .host_str()
            .ok_or_else(|| RegistryError::InvalidUrl("url must have a host".to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if is_internal_hostname(host) {
            return Err(RegistryError::InvalidUrl(format!("host {host} is internal")));
        }

        let addrs = match host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => {
                let port = url.port_or_known_default().unwrap_or(443);
                let addrs = self.resolver.resolve(host, port).await.map_err(|e| {
                    RegistryError::InvalidUrl(format!("host {host} did not resolve: {e}"))
                })?;
                if addrs.is_empty() {
                    return Err(RegistryError::InvalidUrl(format!(
                        "host {host} resolved to no addresses"
                    )));
                }
                addrs
            },
        };

        if let Some(ip) = addrs.iter().find(|ip| is_internal_ip(ip)) {
            return Err(RegistryError::InvalidUrl(format!(
                "host {host} resolves to non-public address {ip}"
            )));
        }

        Ok(url)
    }
}

fn is_internal_hostname(host: &str) -> bool {
    let lower = host.to_ascii_lowercase();
    lower == "localhost"
        || lower.ends_with(".localhost")
        || lower.ends_with(".internal")
        || lower.ends_with(".local")
}

/// Returns true for any address that is not publicly routable.
pub fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_ipv4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_ipv4(&mapped);
            }
            is_internal_ipv6(v6)
        },
    }
}

fn is_internal_ipv4(v4: &Ipv4Addr) -> bool {
    let octets = v4.octets();
    v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_multicast()
        || v4.is_broadcast()
        || v4.is_unspecified()
        || v4.is_documentation()
        || octets[0] == 0
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64) // 100.64.0.0/10
        || (octets[0] == 198 && (octets[1] & 0xFE) == 18) // 198.18.0.0/15
        || octets[0] >= 240
}

fn is_internal_ipv6(v6: &Ipv6Addr) -> bool {
    let first = v6.segments()[0];
    v6.is_loopback()
        || v6.is_unspecified()
        || v6.is_multicast()
        || (first & 0xFE00) == 0xFC00 // fc00::/7 unique local
        || (first & 0xFFC0) == 0xFE80 // fe80::/10 link local
        || (first == 0x2001 && v6.segments()[1] == 0x0DB8) // 2001:db8::/32
}

/// Validates an event-type list for a subscription and drops repeated
/// entries, keeping first occurrences in order.
///
/// # Errors
///
/// Returns `RegistryError::Validation` if the list is empty, names an
/// unsupported type, or holds too many distinct types.
pub fn normalize_event_types(events: Vec<String>) -> Result<Vec<String>, RegistryError> {
    if events.is_empty() {
        return Err(RegistryError::Validation("events cannot be empty".to_string()));
    }
    if let Some(unknown) = events.iter().find(|e| !SUPPORTED_EVENTS.contains(&e.as_str())) {
        return Err(RegistryError::Validation(format!("unsupported event type: {unknown}")));
    }

    let mut distinct: Vec<String> = Vec::with_capacity(events.len());
    for event in events {
        if !distinct.contains(&event) {
            distinct.push(event);
        }
    }

    if distinct.len() > MAX_EVENTS_PER_SUBSCRIPTION {
        return Err(RegistryError::Validation(format!(
            "at most {MAX_EVENTS_PER_SUBSCRIPTION} events per subscription"
        )));
    }
    Ok(distinct)
}

/// Validates an optional description.
///
/// # Errors
///
/// Returns `RegistryError::Validation` if the description is too long.
pub fn validate_description(description: Option<&str>) -> Result<(), RegistryError> {
    match description {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LENGTH => Err(RegistryError::Validation(
            format!("description exceeds {MAX_DESCRIPTION_LENGTH} characters"),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io};

    use super::*;

    #[derive(Debug, Default)]
    struct FixedResolver(HashMap<String, Vec<IpAddr>>);

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
            self.0
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
        }
    }

    fn validator(entries: &[(&str, &str)]) -> UrlValidator {
        let map = entries
            .iter()
            .map(|(host, ip)| ((*host).to_string(), vec![ip.parse().unwrap()]))
            .collect();
        UrlValidator::new(Arc::new(FixedResolver(map)))
    }

    #[tokio::test]
    async fn public_https_url_is_accepted() {
        let v = validator(&[("hooks.example.com", "93.184.216.34")]);
        let url = v.validate("https://hooks.example.com/clips").await.unwrap();
        assert_eq!(url.host_str(), Some("hooks.example.com"));
    }

    #[tokio::test]
    async fn plain_http_is_accepted() {
        let v = validator(&[("hooks.example.com", "93.184.216.34")]);
        assert!(v.validate("http://hooks.example.com:8080/clips").await.is_ok());
    }

    #[tokio::test]
    async fn other_schemes_are_rejected() {
        let v = validator(&[]);
        for url in ["ftp://example.com/x", "file:///etc/passwd", "not a url"] {
            assert!(matches!(v.validate(url).await, Err(RegistryError::InvalidUrl(_))), "{url}");
        }
    }

    #[tokio::test]
    async fn literal_internal_addresses_are_rejected() {
        let v = validator(&[]);
        for url in [
            "http://127.0.0.1/hook",
            "http://10.1.2.3/hook",
            "http://192.168.0.10/hook",
            "http://169.254.169.254/latest/meta-data",
            "http://100.64.0.1/hook",
            "http://224.0.0.1/hook",
            "http://[::1]/hook",
            "http://[fe80::1]/hook",
            "http://[fd00::1]/hook",
            "http://[::ffff:127.0.0.1]/hook",
        ] {
            assert!(matches!(v.validate(url).await, Err(RegistryError::InvalidUrl(_))), "{url}");
        }
    }

    #[tokio::test]
    async fn hostnames_resolving_to_private_addresses_are_rejected() {
        let v = validator(&[("rebind.example.com", "10.0.0.5")]);
        let err = v.validate("https://rebind.example.com/hook").await.unwrap_err();
        assert!(err.to_string().contains("non-public"));
    }

    #[tokio::test]
    async fn unresolvable_hosts_are_rejected() {
        let v = validator(&[]);
        let err = v.validate("https://nowhere.example.com/hook").await.unwrap_err();
        assert!(err.to_string().contains("did not resolve"));
    }

    #[tokio::test]
    async fn internal_hostnames_are_rejected_without_lookup() {
        let v = validator(&[("localhost", "93.184.216.34")]);
        for url in ["http://localhost/x", "http://db.internal/x", "http://printer.local/x"] {
            assert!(v.validate(url).await.is_err(), "{url}");
        }
    }

    #[test]
    fn event_types_are_validated() {
        assert!(normalize_event_types(vec!["clip.approved".to_string()]).is_ok());
        assert!(matches!(normalize_event_types(vec![]), Err(RegistryError::Validation(_))));
        assert!(normalize_event_types(vec!["clip.deleted".to_string()]).is_err());
    }

    #[test]
    fn repeated_event_types_collapse_in_order() {
        let events = ["clip.approved", "clip.submitted", "clip.approved", "clip.submitted"]
            .map(String::from)
            .to_vec();

        assert_eq!(
            normalize_event_types(events).unwrap(),
            vec!["clip.approved".to_string(), "clip.submitted".to_string()]
        );
    }

    #[test]
    fn long_descriptions_are_rejected() {
        assert!(validate_description(Some("short")).is_ok());
        assert!(validate_description(Some(&"x".repeat(501))).is_err());
        assert!(validate_description(None).is_ok());
    }
}
