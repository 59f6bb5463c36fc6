//! Service browsing: the seam the discovery engine consumes, and an mDNS browser backed by
//! an `mdns-sd` daemon that shares port 5353 and so sees announcements and goodbyes.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use lanlink_core::mdns::fully_qualified;
use lanlink_core::{BrowseEvent, ServiceInstances};
use mdns_sd::{ServiceDaemon, ServiceEvent};

pub type BrowseStream = BoxStream<'static, Result<BrowseEvent, BrowseError>>;

/// Platform discovery primitive. Each call starts one browse pass; the pass runs until the
/// stream is dropped or yields an error.
pub trait ServiceBrowser: Send + Sync {
    fn browse(&self) -> BrowseStream;
}

#[derive(Debug, thiserror::Error)]
pub enum BrowseError {
    #[error("mdns daemon: {0}")]
    Daemon(#[from] mdns_sd::Error),
    #[error("mdns daemon stopped")]
    Closed,
}

pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    service_type: String,
    /// Latest pass to start browsing. Only that pass may stop the daemon's query.
    passes: Arc<AtomicU64>,
}

impl MdnsBrowser {
    pub fn new(service_type: &str) -> Result<Self, BrowseError> {
        Ok(Self::with_daemon(ServiceDaemon::new()?, service_type))
    }

    pub fn with_daemon(daemon: ServiceDaemon, service_type: &str) -> Self {
        Self {
            daemon,
            service_type: fully_qualified(service_type),
            passes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            tracing::debug!(error = %e, "mdns daemon shutdown");
        }
    }
}

/// Stops the daemon's query when its pass ends, unless a newer pass has taken it over.
struct ActiveBrowse {
    daemon: ServiceDaemon,
    service_type: String,
    pass: u64,
    passes: Arc<AtomicU64>,
}

impl Drop for ActiveBrowse {
    fn drop(&mut self) {
        if self.passes.load(Ordering::SeqCst) != self.pass {
            return;
        }
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            tracing::debug!(error = %e, "mdns stop_browse");
        }
    }
}

fn translate(instances: &mut ServiceInstances, event: ServiceEvent) -> Vec<BrowseEvent> {
    match event {
        ServiceEvent::ServiceResolved(info) => instances.resolved(
            info.get_fullname(),
            info.get_addresses().iter().map(|a| IpAddr::from(*a)),
            info.get_port(),
        ),
        ServiceEvent::ServiceRemoved(_, fullname) => instances.removed(&fullname),
        _ => Vec::new(),
    }
}

impl ServiceBrowser for MdnsBrowser {
    fn browse(&self) -> BrowseStream {
        let daemon = self.daemon.clone();
        let service_type = self.service_type.clone();
        let passes = self.passes.clone();
        Box::pin(async_stream::stream! {
            let pass = passes.fetch_add(1, Ordering::SeqCst) + 1;
            let receiver = match daemon.browse(&service_type) {
                Ok(r) => r,
                Err(e) => {
                    yield Err(BrowseError::from(e));
                    return;
                }
            };
            let _active = ActiveBrowse {
                daemon: daemon.clone(),
                service_type: service_type.clone(),
                pass,
                passes,
            };
            tracing::debug!(service = %service_type, pass, "mdns browse started");
            let mut instances = ServiceInstances::new(&service_type);
            loop {
                match receiver.recv_async().await {
                    Ok(event) => {
                        for event in translate(&mut instances, event) {
                            yield Ok(event);
                        }
                    }
                    Err(_) => {
                        yield Err(BrowseError::Closed);
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_core::ServiceEndpoint;
    use mdns_sd::ServiceInfo;

    const TYPE: &str = "_http._tcp.local.";

    fn info(ip: &str, port: u16) -> ServiceInfo {
        ServiceInfo::new(TYPE, "studio", "studio.local.", ip, port, &[("path", "/")][..]).unwrap()
    }

    #[test]
    fn resolved_and_removed_map_to_endpoint_events() {
        let mut instances = ServiceInstances::new(TYPE);
        let endpoint = ServiceEndpoint::new("studio", "192.168.1.20", 11434);

        let events = translate(&mut instances, ServiceEvent::ServiceResolved(info("192.168.1.20", 11434)));
        assert_eq!(events, vec![BrowseEvent::Added(endpoint.clone())]);

        let again = translate(&mut instances, ServiceEvent::ServiceResolved(info("192.168.1.20", 11434)));
        assert!(again.is_empty());

        let gone = translate(
            &mut instances,
            ServiceEvent::ServiceRemoved(TYPE.into(), format!("studio.{TYPE}")),
        );
        assert_eq!(gone, vec![BrowseEvent::Removed(endpoint)]);
    }

    #[test]
    fn search_bookkeeping_is_ignored() {
        let mut instances = ServiceInstances::new(TYPE);
        assert!(translate(&mut instances, ServiceEvent::SearchStarted(TYPE.into())).is_empty());
        assert!(translate(
            &mut instances,
            ServiceEvent::ServiceFound(TYPE.into(), format!("studio.{TYPE}"))
        )
        .is_empty());
        assert!(translate(&mut instances, ServiceEvent::SearchStopped(TYPE.into())).is_empty());
    }
}
