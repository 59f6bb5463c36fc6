//! LanLink reference implementation.
//! Host-driven: no I/O; the host feeds bytes, resolved services and power readings and acts on the results.

pub mod endpoint;
pub mod event;
pub mod format;
pub mod mdns;
pub mod policy;
pub mod power;
pub mod probe;
pub mod provider;
pub mod recovery;
pub mod session;

pub use endpoint::{DiscoveredEndpoint, EndpointKey, EndpointSet, ServiceEndpoint};
pub use event::{Progress, StreamError, StreamEvent};
pub use format::{FormatAdapter, NdjsonAdapter, SseAdapter, WireFormat};
pub use mdns::{BrowseEvent, ServiceInstances, DEFAULT_SERVICE_TYPE};
pub use policy::{CachePolicy, PollingPolicy, ProbePolicy, TickDecision};
pub use power::{PowerMode, PowerState, PowerStateProvider};
pub use provider::{ChatMessage, Provider, Role, StreamKind};
pub use recovery::{recover_partial_responses, MemoryRecoveryStore, RecoveryError, RecoveryStore};
pub use session::{SessionId, StoreOp, StreamSession};
