//! Events produced by the format adapters for one stream session.

use serde::{Deserialize, Serialize};

/// Why a stream ended in error. Carried as the final event of a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StreamError {
    /// Connection refused, DNS failure, reset mid-body.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    /// The provider reported an error inside the stream body.
    #[error("provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub status: String,
    pub digest: Option<String>,
    pub total: Option<u64>,
    pub completed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    Delta(String),
    Progress(Progress),
    Done,
    Error(StreamError),
}

impl StreamEvent {
    /// `Done` and `Error` end a session; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }
}
