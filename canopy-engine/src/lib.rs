// Canopy Engine Library
// Hierarchical pipeline trees: composition, container scopes, lazy expansion and scheduling

pub mod config;
pub mod definition;
pub mod error;
pub mod execution;
pub mod runners;
pub mod store;
pub mod tree;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ExpansionError, TreeError};

// Re-export tree types
pub use tree::{
    Command, ContainerReuse, ImageRef, LeafResult, Node, NodeAttrs, NodeId, NodeKind, Resources,
    Tree,
};

// Re-export execution types
pub use execution::{
    handler, progress_channel, EventKind, LazyContext, LazyState, NodeEvent, NodeState,
    OperatorCommand, ProgressSender, Run, RunControl, RunEvent, RunReport, ScopeId, ScopeTable,
};

// Re-export runner types
pub use runners::{
    DockerRuntime, LeafContext, LocalRuntime, MockRuntime, Runtime, RuntimeError,
};

// Re-export store types
pub use store::{DataStore, FsStore, MemoryStore, Namespace, StoreError};

// Re-export definition types
pub use definition::{Definition, DefinitionError, DefinitionParser};
