// Data Store
// Byte storage shared between nodes of a run and across runs of one user

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use std::fmt;
use thiserror::Error;

/// Errors raised by a data store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which namespace a store path lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Scoped to a single pipeline run
    Run,
    /// Scoped to the authoring user, shared across runs
    User,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Run => write!(f, "run"),
            Namespace::User => write!(f, "user"),
        }
    }
}

/// Flat path-addressed byte store.
///
/// A `put` by a finished node is visible to any node scheduled after it in
/// Serial order. Concurrent Parallel siblings writing the same path race.
pub trait DataStore: Send + Sync {
    fn get(&self, ns: Namespace, path: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, ns: Namespace, path: &str, data: &[u8]) -> Result<(), StoreError>;

    fn exists(&self, ns: Namespace, path: &str) -> Result<bool, StoreError> {
        Ok(self.get(ns, path)?.is_some())
    }

    /// Paths under `prefix`, sorted
    fn list(&self, ns: Namespace, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Normalize a store path into its segments.
///
/// Leading and trailing slashes are ignored; empty, `.` and `..` segments are
/// rejected.
pub(crate) fn normalize(path: &str) -> Result<String, StoreError> {
    let invalid = |reason: &str| StoreError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(invalid("path is empty"));
    }
    for segment in trimmed.split('/') {
        match segment {
            "" => return Err(invalid("empty segment")),
            "." | ".." => return Err(invalid("relative segments are not allowed")),
            s if s.contains('\\') => return Err(invalid("backslash in segment")),
            _ => {}
        }
    }
    Ok(trimmed.to_string())
}

/// Normalize a listing prefix; an empty prefix lists everything
pub(crate) fn normalize_prefix(prefix: &str) -> Result<String, StoreError> {
    if prefix.trim_matches('/').is_empty() {
        Ok(String::new())
    } else {
        normalize(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/data/x.json").unwrap(), "data/x.json");
        assert_eq!(normalize("data/").unwrap(), "data");
        assert!(normalize("").is_err());
        assert!(normalize("/").is_err());
        assert!(normalize("a//b").is_err());
        assert!(normalize("a/../b").is_err());
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("/").unwrap(), "");
        assert_eq!(normalize_prefix("out/").unwrap(), "out");
    }
}
