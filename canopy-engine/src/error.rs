// Engine Errors
// Construction-time tree errors and run-time engine errors

use crate::runners::RuntimeError;
use crate::store::StoreError;

use thiserror::Error;

/// Result alias used across the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while building or addressing a node tree.
///
/// These are authoring mistakes: they abort tree construction immediately and
/// are never deferred to run time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("a child named '{name}' already exists under '{parent}'")]
    DuplicateName { parent: String, name: String },

    #[error("node '{name}' is already attached under '{parent}'")]
    Attachment { parent: String, name: String },

    #[error("path not found: '{path}' (missing segment '{segment}')")]
    PathNotFound { path: String, segment: String },

    #[error("invalid node name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("node '{path}' is a leaf and cannot hold children")]
    NotAContainer { path: String },
}

/// Errors raised by the engine while driving a run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Internal invariant violation: the ancestor chain of a node could not be
    /// walked to the root. Unreachable for trees built through this crate.
    #[error("ambiguous container scope for '{path}': {reason}")]
    AmbiguousScope { path: String, reason: String },

    #[error("cannot {operation} '{path}' while it is {state}")]
    InvalidTransition {
        path: String,
        operation: &'static str,
        state: String,
    },

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("data store error: {0}")]
    Store(#[from] StoreError),

    #[error("run is already executing")]
    AlreadyRunning,
}

impl EngineError {
    pub fn invalid_transition(
        path: impl Into<String>,
        operation: &'static str,
        state: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            path: path.into(),
            operation,
            state: state.to_string(),
        }
    }
}

/// Failure returned by a Lazy node's generator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExpansionError {
    pub message: String,
}

impl ExpansionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<TreeError> for ExpansionError {
    fn from(err: TreeError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<StoreError> for ExpansionError {
    fn from(err: StoreError) -> Self {
        Self::new(err.to_string())
    }
}
