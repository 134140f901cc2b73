//! Durable per-service pid records.
//!
//! One file per service key under the state directory, holding exactly the
//! textual pid. Absence means "not recorded". The design assumes a single
//! supervisor invocation mutates a given key at a time; concurrent writers
//! are out of scope.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::warn;

use crate::error::{Error, Result};

/// Single-slot-per-key storage for the last recorded main-process pid.
pub trait PidStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<u32>>;
    fn set(&self, key: &str, pid: u32) -> Result<()>;
    fn clear(&self, key: &str) -> Result<()>;
}

/// Pid files at `<dir>/<key>.pid`.
pub struct FilePidStore {
    dir: PathBuf,
}

impl FilePidStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.pid"))
    }
}

impl PidStore for FilePidStore {
    fn get(&self, key: &str) -> Result<Option<u32>> {
        let path = self.path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Io("failed to read pid file", err)),
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => {
                // A corrupt slot must not leak to callers; purge it.
                warn!("discarding corrupt pid file {}", path.display());
                self.clear(key)?;
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, pid: u32) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Io("failed to create pid directory", e))?;
        fs::write(self.path(key), pid.to_string())
            .map_err(|e| Error::Io("failed to write pid file", e))
    }

    fn clear(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Io("failed to remove pid file", err)),
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory store shared by engine tests.

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::PidStore;
    use crate::error::Result;

    #[derive(Default)]
    pub struct FakeStore {
        slots: Mutex<HashMap<String, u32>>,
    }

    impl FakeStore {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn pid(&self, key: &str) -> Option<u32> {
            self.slots.lock().unwrap().get(key).copied()
        }

        pub fn seed(&self, key: &str, pid: u32) {
            self.slots.lock().unwrap().insert(key.to_string(), pid);
        }
    }

    impl PidStore for Arc<FakeStore> {
        fn get(&self, key: &str) -> Result<Option<u32>> {
            Ok(self.pid(key))
        }

        fn set(&self, key: &str, pid: u32) -> Result<()> {
            self.seed(key, pid);
            Ok(())
        }

        fn clear(&self, key: &str) -> Result<()> {
            self.slots.lock().unwrap().remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_pid() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path());
        assert_eq!(store.get("python").unwrap(), None);
        store.set("python", 4321).unwrap();
        assert_eq!(store.get("python").unwrap(), Some(4321));
        store.clear("python").unwrap();
        assert_eq!(store.get("python").unwrap(), None);
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path());
        store.clear("python").unwrap();
        store.clear("python").unwrap();
    }

    #[test]
    fn corrupt_slot_reads_as_absent_and_is_purged() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path());
        std::fs::write(dir.path().join("python.pid"), "not-a-pid").unwrap();
        assert_eq!(store.get("python").unwrap(), None);
        assert!(!dir.path().join("python.pid").exists());
    }

    #[test]
    fn keys_use_separate_slots() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePidStore::new(dir.path());
        store.set("a", 1).unwrap();
        store.set("b", 2).unwrap();
        store.clear("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("b").unwrap(), Some(2));
    }
}
