// Node Model
// Owned, author-facing node values: Serial / Parallel / Exec / Lazy

use crate::error::{ExpansionError, TreeError};
use crate::execution::control::RunControl;
use crate::execution::events::{Callback, EventKind, Handler, HandlerResult, NodeEvent};
use crate::execution::lazy::LazyContext;
use crate::runners::LeafContext;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Path separator used in node paths
pub const PATH_SEPARATOR: char = '/';

/// Result type returned by callable-backed Exec leaves
pub type LeafResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callable backing an Exec leaf
pub type LeafFn = Arc<dyn Fn(&LeafContext) -> LeafResult + Send + Sync>;

/// Callable producing the subtree of a Lazy node
pub type LazyFn = Arc<dyn Fn(&LazyContext) -> Result<Node, ExpansionError> + Send + Sync>;

/// Container reuse annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerReuse {
    /// Share the scope of the enclosing group
    #[default]
    Inherit,
    /// Open a fresh scope for this node and its inheriting descendants
    New,
    /// Rejoin the run-wide default scope
    Global,
}

impl fmt::Display for ContainerReuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerReuse::Inherit => write!(f, "inherit"),
            ContainerReuse::New => write!(f, "new"),
            ContainerReuse::Global => write!(f, "global"),
        }
    }
}

/// Opaque handle describing a leaf's execution environment.
///
/// The engine never interprets it; it is inherited down the tree and handed to
/// the runtime untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource hints, inherited like the image and passed to the runtime as-is
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: Option<f64>,
    pub mem: Option<f64>,
    pub requires_docker: Option<bool>,
}

impl Resources {
    /// Fill unset fields from `parent`
    pub fn inherit_from(&self, parent: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.or(parent.cpu),
            mem: self.mem.or(parent.mem),
            requires_docker: self.requires_docker.or(parent.requires_docker),
        }
    }
}

/// Attributes shared by every node variant
#[derive(Debug, Clone, Default)]
pub struct NodeAttrs {
    pub image: Option<ImageRef>,
    pub reuse: ContainerReuse,
    pub skip: bool,
    /// Only consulted on Serial nodes
    pub stop_on_error: bool,
    pub env: BTreeMap<String, String>,
    pub doc: Option<String>,
    pub resources: Resources,
}

impl NodeAttrs {
    fn new() -> Self {
        Self {
            stop_on_error: true,
            ..Default::default()
        }
    }
}

/// What an Exec leaf runs
#[derive(Clone)]
pub enum Command {
    /// Shell command line
    Shell(String),
    /// In-process callable with its stored arguments
    Callable { func: LeafFn, args: Vec<String> },
}

impl Command {
    /// Short human-readable description
    pub fn describe(&self) -> String {
        match self {
            Command::Shell(cmd) => cmd.clone(),
            Command::Callable { args, .. } if args.is_empty() => "<callable>".to_string(),
            Command::Callable { args, .. } => format!("<callable> {}", args.join(" ")),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Shell(cmd) => f.debug_tuple("Shell").field(cmd).finish(),
            Command::Callable { args, .. } => {
                f.debug_struct("Callable").field("args", args).finish_non_exhaustive()
            }
        }
    }
}

/// Stored generator of a Lazy node
#[derive(Clone)]
pub struct LazyGenerator {
    pub func: LazyFn,
    pub args: Vec<String>,
}

impl fmt::Debug for LazyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyGenerator")
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// Node variant
#[derive(Debug, Clone)]
pub enum NodeKind {
    Serial,
    Parallel,
    Exec(Command),
    Lazy(LazyGenerator),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Serial => "serial",
            NodeKind::Parallel => "parallel",
            NodeKind::Exec(_) => "exec",
            NodeKind::Lazy(_) => "lazy",
        }
    }

    /// Serial and Parallel nodes hold children; Lazy nodes receive them on expansion
    pub fn is_group(&self) -> bool {
        matches!(self, NodeKind::Serial | NodeKind::Parallel)
    }
}

/// An authored node and its (owned) children
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) kind: NodeKind,
    pub(crate) attrs: NodeAttrs,
    pub(crate) callbacks: Vec<Callback>,
    pub(crate) children: Vec<(String, Node)>,
}

impl Node {
    fn with_kind(kind: NodeKind) -> Self {
        Self {
            kind,
            attrs: NodeAttrs::new(),
            callbacks: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Children run one after another, in insertion order
    pub fn serial() -> Self {
        Self::with_kind(NodeKind::Serial)
    }

    /// Children run concurrently
    pub fn parallel() -> Self {
        Self::with_kind(NodeKind::Parallel)
    }

    /// Leaf running a shell command
    pub fn exec(command: impl Into<String>) -> Self {
        Self::with_kind(NodeKind::Exec(Command::Shell(command.into())))
    }

    /// Leaf running an in-process callable with stored arguments
    pub fn exec_fn<F>(func: F, args: Vec<String>) -> Self
    where
        F: Fn(&LeafContext) -> LeafResult + Send + Sync + 'static,
    {
        Self::with_kind(NodeKind::Exec(Command::Callable {
            func: Arc::new(func),
            args,
        }))
    }

    /// Placeholder replaced at run time by the subtree `func` returns
    pub fn lazy<F>(func: F) -> Self
    where
        F: Fn(&LazyContext) -> Result<Node, ExpansionError> + Send + Sync + 'static,
    {
        Self::lazy_with_args(func, Vec::new())
    }

    pub fn lazy_with_args<F>(func: F, args: Vec<String>) -> Self
    where
        F: Fn(&LazyContext) -> Result<Node, ExpansionError> + Send + Sync + 'static,
    {
        Self::with_kind(NodeKind::Lazy(LazyGenerator {
            func: Arc::new(func),
            args,
        }))
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.attrs.image = Some(ImageRef::new(image));
        self
    }

    /// Set the container reuse annotation. Fixed once the node is attached.
    pub fn with_reuse(mut self, reuse: ContainerReuse) -> Self {
        self.attrs.reuse = reuse;
        self
    }

    pub fn with_skip(mut self, skip: bool) -> Self {
        self.attrs.skip = skip;
        self
    }

    pub fn with_stop_on_error(mut self, stop_on_error: bool) -> Self {
        self.attrs.stop_on_error = stop_on_error;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.attrs.env.insert(k.into(), v.into());
        }
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.attrs.doc = Some(doc.into());
        self
    }

    pub fn with_cpu(mut self, cpu: f64) -> Self {
        self.attrs.resources.cpu = Some(cpu);
        self
    }

    pub fn with_mem(mut self, mem: f64) -> Self {
        self.attrs.resources.mem = Some(mem);
        self
    }

    pub fn with_requires_docker(mut self, requires_docker: bool) -> Self {
        self.attrs.resources.requires_docker = Some(requires_docker);
        self
    }

    /// Register a lifecycle handler
    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&NodeEvent, &RunControl) -> HandlerResult + Send + Sync + 'static,
    {
        self.callbacks.push(Callback::new(kind, Arc::new(handler)));
        self
    }

    /// Register an already shared handler
    pub fn on_shared(mut self, kind: EventKind, handler: Handler) -> Self {
        self.callbacks.push(Callback::new(kind, handler));
        self
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn attrs(&self) -> &NodeAttrs {
        &self.attrs
    }

    pub fn set_skip(&mut self, skip: bool) {
        self.attrs.skip = skip;
    }

    /// Iterate children in insertion order
    pub fn children(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.children.iter().map(|(name, node)| (name.as_str(), node))
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.children
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }

    /// Attach `child` under `name`, returning a handle to the attached child
    pub fn add(&mut self, name: impl Into<String>, child: Node) -> Result<&mut Node, TreeError> {
        let name = name.into();
        validate_name(&name)?;
        if !self.kind.is_group() {
            return Err(TreeError::NotAContainer {
                path: format!("<{}>", self.kind.label()),
            });
        }
        if self.child(&name).is_some() {
            return Err(TreeError::DuplicateName {
                parent: "<node>".to_string(),
                name,
            });
        }
        self.children.push((name, child));
        let last = self.children.len() - 1;
        Ok(&mut self.children[last].1)
    }

    /// Builder form of [`Node::add`]
    pub fn child_node(mut self, name: impl Into<String>, child: Node) -> Result<Self, TreeError> {
        self.add(name, child)?;
        Ok(self)
    }

    /// Attach `child` at a slash-separated path relative to this node.
    ///
    /// Every segment but the last must already exist.
    pub fn insert_path(&mut self, path: &str, child: Node) -> Result<&mut Node, TreeError> {
        let segments = split_path(path);
        let Some((last, parents)) = segments.split_last() else {
            return Err(TreeError::InvalidName {
                name: path.to_string(),
                reason: "empty path".to_string(),
            });
        };

        let mut cursor = self;
        let mut walked = String::new();
        for segment in parents {
            walked.push(PATH_SEPARATOR);
            walked.push_str(segment);
            cursor = cursor
                .child_mut(segment)
                .ok_or_else(|| TreeError::PathNotFound {
                    path: path.to_string(),
                    segment: segment.to_string(),
                })?;
        }

        let parent_label = if walked.is_empty() { "/".to_string() } else { walked };
        cursor.add(*last, child).map_err(|err| match err {
            TreeError::DuplicateName { name, .. } => TreeError::DuplicateName {
                parent: parent_label.clone(),
                name,
            },
            TreeError::NotAContainer { .. } => TreeError::NotAContainer {
                path: parent_label.clone(),
            },
            other => other,
        })
    }

    /// Resolve a slash-separated path relative to this node
    pub fn get(&self, path: &str) -> Result<&Node, TreeError> {
        let mut cursor = self;
        for segment in split_path(path) {
            cursor = cursor.child(segment).ok_or_else(|| TreeError::PathNotFound {
                path: path.to_string(),
                segment: segment.to_string(),
            })?;
        }
        Ok(cursor)
    }
}

/// Split a node path into its non-empty segments
pub fn split_path(path: &str) -> Vec<&str> {
    path.split(PATH_SEPARATOR).filter(|s| !s.is_empty()).collect()
}

pub(crate) fn validate_name(name: &str) -> Result<(), TreeError> {
    if name.is_empty() {
        return Err(TreeError::InvalidName {
            name: name.to_string(),
            reason: "names must not be empty".to_string(),
        });
    }
    if name.contains(PATH_SEPARATOR) {
        return Err(TreeError::InvalidName {
            name: name.to_string(),
            reason: "names must not contain '/'".to_string(),
        });
    }
    Ok(())
}
