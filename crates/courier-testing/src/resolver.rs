//! Deterministic DNS for URL validation tests.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use courier_delivery::validation::Resolver;

/// Public address used for hosts registered without an explicit address.
pub const PUBLIC_TEST_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));

/// Resolver answering from a fixed table. Unknown hosts fail to resolve.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: Arc<RwLock<HashMap<String, Vec<IpAddr>>>>,
}

impl StaticResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver that knows the usual public test hosts.
    pub fn with_public_hosts() -> Self {
        let resolver = Self::new();
        for host in ["hooks.example.com", "api.example.com", "example.com"] {
            resolver.insert(host, PUBLIC_TEST_IP);
        }
        resolver
    }

    /// Adds an address for `host`.
    pub fn insert(&self, host: impl Into<String>, ip: IpAddr) {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.entry(host.into()).or_default().push(ip);
        }
    }

    /// Builder form of `insert`.
    #[must_use]
    pub fn with_host(self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.insert(host, ip);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        let hosts = self.hosts.read().map_err(|_| io::Error::other("resolver lock poisoned"))?;
        hosts
            .get(host)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {host}")))
    }
}
