//! DNS-SD instance tracking. The host's mDNS resolver reports instances by full name as they
//! resolve or leave; this turns those reports into add/remove events for endpoints.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::endpoint::ServiceEndpoint;

/// Default service type browsed for. The target server does not advertise a type of its own.
pub const DEFAULT_SERVICE_TYPE: &str = "_http._tcp.local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Added(ServiceEndpoint),
    Removed(ServiceEndpoint),
}

/// `_http._tcp.local` → `_http._tcp.local.`; resolvers want the rooted form.
pub fn fully_qualified(service_type: &str) -> String {
    format!("{}.", service_type.trim_end_matches('.'))
}

/// Lowest IPv4 address, else lowest IPv6.
pub fn preferred_addr(addrs: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    addrs.into_iter().min_by_key(|a| (a.is_ipv6(), *a))
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Instances announced during one browse pass, keyed by normalized full name.
pub struct ServiceInstances {
    suffix: String,
    announced: HashMap<String, ServiceEndpoint>,
}

impl ServiceInstances {
    pub fn new(service_type: &str) -> Self {
        Self {
            suffix: format!(".{}", normalize(service_type)),
            announced: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.announced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.announced.is_empty()
    }

    /// `My Box._http._tcp.local.` → `My Box`. Names outside the service type are kept whole.
    pub fn instance_name(&self, fullname: &str) -> String {
        let trimmed = fullname.trim_end_matches('.');
        if trimmed.len() > self.suffix.len() && trimmed.to_ascii_lowercase().ends_with(&self.suffix) {
            trimmed[..trimmed.len() - self.suffix.len()].to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// An instance resolved (or re-resolved). A changed address or port is reported as the old
    /// endpoint leaving and the new one arriving.
    pub fn resolved(
        &mut self,
        fullname: &str,
        addrs: impl IntoIterator<Item = IpAddr>,
        port: u16,
    ) -> Vec<BrowseEvent> {
        let Some(addr) = preferred_addr(addrs) else {
            return Vec::new();
        };
        let endpoint = ServiceEndpoint::from_addr(self.instance_name(fullname), addr, port);
        match self.announced.insert(normalize(fullname), endpoint.clone()) {
            None => vec![BrowseEvent::Added(endpoint)],
            Some(old) if old == endpoint => Vec::new(),
            Some(old) => vec![BrowseEvent::Removed(old), BrowseEvent::Added(endpoint)],
        }
    }

    /// Goodbye or expiry. Unknown names produce nothing.
    pub fn removed(&mut self, fullname: &str) -> Vec<BrowseEvent> {
        self.announced
            .remove(&normalize(fullname))
            .map(BrowseEvent::Removed)
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const FULLNAME: &str = "Studio Mac._http._tcp.local.";

    fn v4(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn rooted_service_type() {
        assert_eq!(fully_qualified("_http._tcp.local"), "_http._tcp.local.");
        assert_eq!(fully_qualified("_http._tcp.local."), "_http._tcp.local.");
    }

    #[test]
    fn prefers_ipv4() {
        let v6 = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
        assert_eq!(preferred_addr([v6, v4(9), v4(3)]), Some(v4(3)));
        assert_eq!(preferred_addr([v6]), Some(v6));
        assert_eq!(preferred_addr([]), None);
    }

    #[test]
    fn instance_names_drop_the_service_suffix() {
        let instances = ServiceInstances::new("_http._tcp.local");
        assert_eq!(instances.instance_name(FULLNAME), "Studio Mac");
        assert_eq!(instances.instance_name("studio._HTTP._tcp.local"), "studio");
        assert_eq!(instances.instance_name("other._ipp._tcp.local."), "other._ipp._tcp.local");
    }

    #[test]
    fn resolve_change_and_leave() {
        let mut instances = ServiceInstances::new("_http._tcp.local");
        let first = ServiceEndpoint::new("Studio Mac", "192.168.1.20", 11434);
        assert_eq!(
            instances.resolved(FULLNAME, [v4(20)], 11434),
            vec![BrowseEvent::Added(first.clone())]
        );
        assert!(instances.resolved(FULLNAME, [v4(20)], 11434).is_empty());

        let moved = ServiceEndpoint::new("Studio Mac", "192.168.1.21", 11434);
        assert_eq!(
            instances.resolved(FULLNAME, [v4(21)], 11434),
            vec![BrowseEvent::Removed(first), BrowseEvent::Added(moved.clone())]
        );
        assert_eq!(instances.len(), 1);

        assert_eq!(
            instances.removed("studio mac._http._tcp.local"),
            vec![BrowseEvent::Removed(moved)]
        );
        assert!(instances.removed(FULLNAME).is_empty());
        assert!(instances.is_empty());
    }

    #[test]
    fn resolution_without_addresses_is_ignored() {
        let mut instances = ServiceInstances::new("_http._tcp.local");
        assert!(instances.resolved(FULLNAME, [], 11434).is_empty());
        assert!(instances.is_empty());
    }
}
