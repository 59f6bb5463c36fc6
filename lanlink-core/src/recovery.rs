//! Recovery store surface: partial response text keyed by stream session id.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("recovery store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid recovery id: {0}")]
    InvalidId(String),
}

/// Flat, crash-durable key/value surface provided by the host.
/// Keys are disjoint per session, so implementations only need per-key atomicity.
pub trait RecoveryStore: Send + Sync {
    fn put(&self, id: &str, text: &str) -> Result<(), RecoveryError>;
    fn get(&self, id: &str) -> Result<Option<String>, RecoveryError>;
    fn remove(&self, id: &str) -> Result<(), RecoveryError>;
    fn list_pending_ids(&self) -> Result<Vec<String>, RecoveryError>;
}

/// Every pending id with its partial text. Ids whose entry vanished between list and get
/// are left out.
pub fn recover_partial_responses(
    store: &dyn RecoveryStore,
) -> Result<BTreeMap<String, String>, RecoveryError> {
    let mut out = BTreeMap::new();
    for id in store.list_pending_ids()? {
        if let Some(text) = store.get(&id)? {
            out.insert(id, text);
        }
    }
    Ok(out)
}

/// In-process store. Survives nothing; used by tests and hosts with their own persistence.
#[derive(Debug, Default)]
pub struct MemoryRecoveryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryRecoveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecoveryStore for MemoryRecoveryStore {
    fn put(&self, id: &str, text: &str) -> Result<(), RecoveryError> {
        self.entries.lock().insert(id.to_string(), text.to_string());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<String>, RecoveryError> {
        Ok(self.entries.lock().get(id).cloned())
    }

    fn remove(&self, id: &str) -> Result<(), RecoveryError> {
        self.entries.lock().remove(id);
        Ok(())
    }

    fn list_pending_ids(&self) -> Result<Vec<String>, RecoveryError> {
        let mut ids: Vec<String> = self.entries.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recover_lists_all_pending() {
        let store = MemoryRecoveryStore::new();
        store.put("a", "partial").unwrap();
        store.put("b", "").unwrap();
        store.put("c", "gone").unwrap();
        store.remove("c").unwrap();
        let recovered = recover_partial_responses(&store).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered["a"], "partial");
        assert_eq!(recovered["b"], "");
    }
}
