// Filesystem Store
// DataStore backed by a directory: <root>/runs/<run id>/... and <root>/user/...

use crate::store::{normalize, normalize_prefix, DataStore, Namespace, StoreError};

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    run_id: String,
}

impl FsStore {
    /// Store rooted at `root` for the run `run_id`
    pub fn new(root: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            run_id: run_id.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, ns: Namespace) -> PathBuf {
        match ns {
            Namespace::Run => self.root.join("runs").join(&self.run_id),
            Namespace::User => self.root.join("user"),
        }
    }

    fn resolve(&self, ns: Namespace, path: &str) -> Result<PathBuf, StoreError> {
        let relative = normalize(path)?;
        Ok(self.namespace_dir(ns).join(relative))
    }
}

impl DataStore for FsStore {
    fn get(&self, ns: Namespace, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let file = self.resolve(ns, path)?;
        if file.is_dir() {
            return Ok(None);
        }
        match fs::read(&file) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, ns: Namespace, path: &str, data: &[u8]) -> Result<(), StoreError> {
        let file = self.resolve(ns, path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&file, data)?;
        Ok(())
    }

    fn exists(&self, ns: Namespace, path: &str) -> Result<bool, StoreError> {
        Ok(self.resolve(ns, path)?.is_file())
    }

    fn list(&self, ns: Namespace, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = self.namespace_dir(ns);
        let prefix = normalize_prefix(prefix)?;
        let start = if prefix.is_empty() {
            base.clone()
        } else {
            base.join(&prefix)
        };

        let mut found = Vec::new();
        if start.is_file() {
            found.push(prefix);
            return Ok(found);
        }
        if !start.is_dir() {
            return Ok(found);
        }

        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&base) {
                    let parts: Vec<_> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    found.push(parts.join("/"));
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_and_user_namespaces() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path(), "run-1");

        store.put(Namespace::Run, "/data/x", b"run").unwrap();
        store.put(Namespace::User, "/data/x", b"user").unwrap();

        assert!(dir.path().join("runs/run-1/data/x").is_file());
        assert!(dir.path().join("user/data/x").is_file());
        assert_eq!(
            store.get(Namespace::Run, "data/x").unwrap(),
            Some(b"run".to_vec())
        );

        // another run sees the user namespace but not the run namespace
        let other = FsStore::new(dir.path(), "run-2");
        assert_eq!(other.get(Namespace::Run, "data/x").unwrap(), None);
        assert_eq!(
            other.get(Namespace::User, "data/x").unwrap(),
            Some(b"user".to_vec())
        );
    }

    #[test]
    fn test_list_and_exists() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path(), "run");
        store.put(Namespace::Run, "out/b", b"2").unwrap();
        store.put(Namespace::Run, "out/a", b"1").unwrap();
        store.put(Namespace::Run, "other", b"3").unwrap();

        assert_eq!(
            store.list(Namespace::Run, "out").unwrap(),
            vec!["out/a".to_string(), "out/b".to_string()]
        );
        assert_eq!(store.list(Namespace::Run, "/").unwrap().len(), 3);
        assert!(store.list(Namespace::Run, "missing").unwrap().is_empty());
        assert!(store.exists(Namespace::Run, "other").unwrap());
        assert!(!store.exists(Namespace::Run, "out").unwrap());
    }

    #[test]
    fn test_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path(), "run");
        assert!(store.put(Namespace::Run, "../x", b"").is_err());
    }
}
