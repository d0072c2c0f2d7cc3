// In-Memory Store
// DataStore kept in process memory, for tests and single-process runs

use crate::store::{normalize, normalize_prefix, DataStore, Namespace, StoreError};

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<(Namespace, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<(Namespace, String), Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DataStore for MemoryStore {
    fn get(&self, ns: Namespace, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = (ns, normalize(path)?);
        Ok(self.entries().get(&key).cloned())
    }

    fn put(&self, ns: Namespace, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let key = (ns, normalize(path)?);
        self.entries().insert(key, data.to_vec());
        Ok(())
    }

    fn list(&self, ns: Namespace, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = normalize_prefix(prefix)?;
        Ok(self
            .entries()
            .keys()
            .filter(|(key_ns, path)| {
                *key_ns == ns
                    && (prefix.is_empty()
                        || path == &prefix
                        || path.starts_with(&format!("{}/", prefix)))
            })
            .map(|(_, path)| path.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let store = MemoryStore::new();
        store.put(Namespace::Run, "/data/x", b"42").unwrap();

        assert_eq!(
            store.get(Namespace::Run, "data/x").unwrap(),
            Some(b"42".to_vec())
        );
        assert!(store.exists(Namespace::Run, "/data/x").unwrap());
        assert_eq!(store.get(Namespace::User, "/data/x").unwrap(), None);
    }

    #[test]
    fn test_list_by_prefix() {
        let store = MemoryStore::new();
        store.put(Namespace::Run, "out/a", b"1").unwrap();
        store.put(Namespace::Run, "out/b", b"2").unwrap();
        store.put(Namespace::Run, "outside", b"3").unwrap();
        store.put(Namespace::User, "out/c", b"4").unwrap();

        assert_eq!(
            store.list(Namespace::Run, "out").unwrap(),
            vec!["out/a".to_string(), "out/b".to_string()]
        );
        assert_eq!(store.list(Namespace::Run, "").unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_path() {
        let store = MemoryStore::new();
        let err = store.put(Namespace::Run, "../escape", b"").unwrap_err();
        assert!(matches!(err, StoreError::InvalidPath { .. }));
    }
}
