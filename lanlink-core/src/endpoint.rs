//! Endpoint identity and the live endpoint set owned by the discovery engine.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Stable endpoint key: `host:port`, IPv6 hosts bracketed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointKey(String);

impl EndpointKey {
    pub fn from_host_port(host: &str, port: u16) -> Self {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.contains(':') && !host.starts_with('[') {
            Self(format!("[{}]:{}", host, port))
        } else {
            Self(format!("{}:{}", host, port))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A service reported by the browser, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceEndpoint {
    /// Instance name as advertised (first label of the DNS-SD instance).
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl ServiceEndpoint {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    pub fn from_addr(name: impl Into<String>, addr: IpAddr, port: u16) -> Self {
        Self::new(name, addr.to_string(), port)
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey::from_host_port(&self.host, self.port)
    }

    /// `http://host:port` with IPv6 hosts bracketed.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.key())
    }
}

/// An endpoint that passed validation. Snapshots of these are what subscribers see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredEndpoint {
    pub key: EndpointKey,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub validated: bool,
}

impl DiscoveredEndpoint {
    pub fn validated(service: &ServiceEndpoint) -> Self {
        Self {
            key: service.key(),
            name: service.name.clone(),
            host: service.host.clone(),
            port: service.port,
            validated: true,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.key)
    }
}

/// Live endpoint set keyed by [`EndpointKey`]. At most one entry per key.
#[derive(Debug, Default, Clone)]
pub struct EndpointSet {
    entries: BTreeMap<EndpointKey, DiscoveredEndpoint>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns true if the visible content changed.
    pub fn insert(&mut self, endpoint: DiscoveredEndpoint) -> bool {
        match self.entries.get(&endpoint.key) {
            Some(existing) if *existing == endpoint => false,
            _ => {
                self.entries.insert(endpoint.key.clone(), endpoint);
                true
            }
        }
    }

    pub fn remove(&mut self, key: &EndpointKey) -> Option<DiscoveredEndpoint> {
        self.entries.remove(key)
    }

    /// Returns true if anything was removed.
    pub fn clear(&mut self) -> bool {
        let had = !self.entries.is_empty();
        self.entries.clear();
        had
    }

    pub fn contains(&self, key: &EndpointKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ordered by key.
    pub fn snapshot(&self) -> Vec<DiscoveredEndpoint> {
        self.entries.values().cloned().collect()
    }
}
