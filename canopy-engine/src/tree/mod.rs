// Tree Module
// Node model: authored nodes and the arena tree a run operates on

pub mod arena;
pub mod node;

pub use arena::{NodeId, Outcome, Tree};
pub use node::{
    split_path, Command, ContainerReuse, ImageRef, LazyFn, LazyGenerator, LeafFn, LeafResult,
    Node, NodeAttrs, NodeKind, Resources, PATH_SEPARATOR,
};
