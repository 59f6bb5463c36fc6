//! LanLink on Linux: tokio runtime around `lanlink-core`. mDNS browsing, endpoint
//! validation, the discovery engine actor, streaming sessions and the file recovery store.

pub mod browser;
pub mod config;
pub mod discovery;
pub mod power;
pub mod store;
pub mod streaming;
pub mod validator;

#[cfg(test)]
mod testing;

pub use browser::{BrowseError, MdnsBrowser, ServiceBrowser};
pub use discovery::{DiscoveryEngine, DiscoverySettings, EngineError, EngineStatus};
pub use power::{watch_power, ManualPowerProvider, SysfsPowerProvider};
pub use store::FileRecoveryStore;
pub use streaming::{StreamHandle, StreamRequest, StreamingEngine};
pub use validator::{EndpointValidator, HttpValidator};
