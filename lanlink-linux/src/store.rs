//! File-backed recovery store: one file per stream session id.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use lanlink_core::{RecoveryError, RecoveryStore};

const SUFFIX: &str = ".partial";
const MAX_ID_LEN: usize = 128;

pub struct FileRecoveryStore {
    dir: PathBuf,
}

impl FileRecoveryStore {
    /// Creates `dir` if missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RecoveryError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn path(&self, id: &str) -> Result<PathBuf, RecoveryError> {
        let valid = !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(RecoveryError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}{SUFFIX}")))
    }
}

impl RecoveryStore for FileRecoveryStore {
    /// Temp file, fsync, rename: a crash leaves either the old text or the new.
    fn put(&self, id: &str, text: &str) -> Result<(), RecoveryError> {
        let path = self.path(id)?;
        let tmp = self.dir.join(format!(".{id}.tmp"));
        let mut f = fs::File::create(&tmp)?;
        f.write_all(text.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<String>, RecoveryError> {
        match fs::read_to_string(self.path(id)?) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, id: &str) -> Result<(), RecoveryError> {
        match fs::remove_file(self.path(id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_pending_ids(&self) -> Result<Vec<String>, RecoveryError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_core::recover_partial_responses;

    #[test]
    fn put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecoveryStore::open(dir.path().join("recovery")).unwrap();
        assert_eq!(store.get("abc").unwrap(), None);
        store.put("abc", "").unwrap();
        assert_eq!(store.get("abc").unwrap().as_deref(), Some(""));
        store.put("abc", "partial ✓").unwrap();
        assert_eq!(store.get("abc").unwrap().as_deref(), Some("partial ✓"));
        store.remove("abc").unwrap();
        store.remove("abc").unwrap();
        assert_eq!(store.get("abc").unwrap(), None);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileRecoveryStore::open(dir.path()).unwrap();
            store.put("s-1", "hello").unwrap();
            store.put("s-2", "wor").unwrap();
        }
        let store = FileRecoveryStore::open(dir.path()).unwrap();
        let recovered = recover_partial_responses(&store).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered["s-1"], "hello");
        assert_eq!(recovered["s-2"], "wor");
    }

    #[test]
    fn ignores_temp_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecoveryStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(".x.tmp"), "half").unwrap();
        fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        store.put("real", "ok").unwrap();
        assert_eq!(store.list_pending_ids().unwrap(), vec!["real".to_string()]);
    }

    #[test]
    fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecoveryStore::open(dir.path()).unwrap();
        for bad in ["", "../etc/passwd", "a/b", "a.b"] {
            assert!(matches!(store.put(bad, "x"), Err(RecoveryError::InvalidId(_))));
        }
    }
}
