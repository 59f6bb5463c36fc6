//! Stream session bookkeeping: id, append-only accumulation buffer, and the recovery store
//! writes that mirror it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::event::StreamEvent;
use crate::format::WireFormat;
use crate::recovery::{RecoveryError, RecoveryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// A write the host owes the recovery store. The session produces these in order; the host
/// must apply each one before forwarding the event that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Put { id: String, text: String },
    Remove { id: String },
}

impl StoreOp {
    pub fn apply(&self, store: &dyn RecoveryStore) -> Result<(), RecoveryError> {
        match self {
            StoreOp::Put { id, text } => store.put(id, text),
            StoreOp::Remove { id } => store.remove(id),
        }
    }
}

pub struct StreamSession {
    id: SessionId,
    key: String,
    url: String,
    format: WireFormat,
    buffer: String,
    terminal: bool,
}

impl StreamSession {
    pub fn new(id: SessionId, url: String, format: WireFormat) -> Self {
        Self {
            id,
            key: id.to_string(),
            url,
            format,
            buffer: String::new(),
            terminal: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Recovery store key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Text received so far.
    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Mark the session pending before any delta arrives. An id that already has an entry
    /// keeps its old text until the first delta of this session replaces it.
    pub fn open(&mut self, has_entry: bool) -> Option<StoreOp> {
        (!has_entry).then(|| self.put())
    }

    /// Apply one adapter event. Deltas are appended and written through; `Done` clears the
    /// recovery entry; `Error` keeps it so the partial text stays recoverable.
    pub fn record(&mut self, event: &StreamEvent) -> Option<StoreOp> {
        if self.terminal {
            return None;
        }
        match event {
            StreamEvent::Delta(text) => {
                self.buffer.push_str(text);
                Some(self.put())
            }
            StreamEvent::Progress(_) => None,
            StreamEvent::Done => {
                self.terminal = true;
                Some(StoreOp::Remove {
                    id: self.key.clone(),
                })
            }
            StreamEvent::Error(_) => {
                self.terminal = true;
                None
            }
        }
    }

    fn put(&self) -> StoreOp {
        StoreOp::Put {
            id: self.key.clone(),
            text: self.buffer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StreamError;
    use crate::recovery::{recover_partial_responses, MemoryRecoveryStore};

    fn session() -> StreamSession {
        StreamSession::new(SessionId::new(), "http://h/api/chat".into(), WireFormat::Ndjson)
    }

    fn apply(store: &MemoryRecoveryStore, op: Option<StoreOp>) {
        if let Some(op) = op {
            op.apply(store).unwrap();
        }
    }

    #[test]
    fn deltas_are_written_through() {
        let store = MemoryRecoveryStore::new();
        let mut s = session();
        let id = s.key().to_string();
        apply(&store, s.open(false));
        assert_eq!(store.get(&id).unwrap().as_deref(), Some(""));
        apply(&store, s.record(&StreamEvent::Delta("a".into())));
        assert_eq!(store.get(&id).unwrap().as_deref(), Some("a"));
        apply(&store, s.record(&StreamEvent::Delta("b".into())));
        assert_eq!(recover_partial_responses(&store).unwrap()[&id], "ab");
    }

    #[test]
    fn done_clears_entry() {
        let store = MemoryRecoveryStore::new();
        let mut s = session();
        apply(&store, s.open(false));
        apply(&store, s.record(&StreamEvent::Delta("a".into())));
        let op = s.record(&StreamEvent::Done);
        assert_eq!(op, Some(StoreOp::Remove { id: s.key().to_string() }));
        apply(&store, op);
        assert!(s.is_terminal());
        assert_eq!(s.text(), "a");
        assert!(store.list_pending_ids().unwrap().is_empty());
    }

    #[test]
    fn error_keeps_entry_and_freezes_buffer() {
        let store = MemoryRecoveryStore::new();
        let mut s = session();
        let id = s.key().to_string();
        apply(&store, s.open(false));
        apply(&store, s.record(&StreamEvent::Delta("par".into())));
        assert_eq!(s.record(&StreamEvent::Error(StreamError::Transport("reset".into()))), None);
        assert_eq!(s.record(&StreamEvent::Delta("tial".into())), None);
        assert_eq!(s.text(), "par");
        assert_eq!(store.get(&id).unwrap().as_deref(), Some("par"));
    }

    #[test]
    fn reopened_id_keeps_old_text_until_first_delta() {
        let store = MemoryRecoveryStore::new();
        let mut s = session();
        let id = s.key().to_string();
        store.put(&id, "earlier").unwrap();
        assert_eq!(s.open(true), None);
        assert_eq!(s.record(&StreamEvent::Progress(Default::default())), None);
        assert_eq!(store.get(&id).unwrap().as_deref(), Some("earlier"));
        apply(&store, s.record(&StreamEvent::Delta("new".into())));
        assert_eq!(store.get(&id).unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn session_id_parses_back() {
        let id = SessionId::new();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
    }
}
