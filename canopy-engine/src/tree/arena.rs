// Run Tree
// Arena-backed node tree: parents own children, children refer back by index

use crate::error::TreeError;
use crate::execution::events::Callback;
use crate::execution::state::{LazyState, NodeState};
use crate::tree::node::{
    split_path, validate_name, ImageRef, Node, NodeAttrs, NodeKind, Resources, PATH_SEPARATOR,
};

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Stable identifier of a node within one [`Tree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Identifier of the root of every tree
    pub fn root() -> Self {
        NodeId(0)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

/// Recorded result of a finished leaf or a failed expansion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub name: String,
    /// Lookup-only relation; ownership runs parent → children
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
    pub attrs: NodeAttrs,
    pub callbacks: Vec<Callback>,
    pub state: NodeState,
    pub lazy: Option<LazyState>,
    pub outcome: Option<Outcome>,
    pub killed: bool,
    /// Bumped on RESET and kill so stale runtime results can be discarded
    pub generation: u64,
}

/// A node tree handed to the scheduler for one run
#[derive(Debug, Clone)]
pub struct Tree {
    slots: Vec<Slot>,
}

impl Tree {
    /// Build a tree rooted at `root`
    pub fn new(root: Node) -> Self {
        let mut tree = Self { slots: Vec::new() };
        tree.create(root);
        tree
    }

    pub fn root(&self) -> NodeId {
        NodeId::root()
    }

    /// Number of nodes, attached or not
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn slot(&self, id: NodeId) -> &Slot {
        &self.slots[id.0]
    }

    pub(crate) fn slot_mut(&mut self, id: NodeId) -> &mut Slot {
        &mut self.slots[id.0]
    }

    /// Add `node` (and its children) to the arena without a parent
    pub fn create(&mut self, node: Node) -> NodeId {
        let Node {
            kind,
            attrs,
            callbacks,
            children,
        } = node;

        let id = NodeId(self.slots.len());
        let state = if attrs.skip {
            NodeState::Skipped
        } else {
            NodeState::Pending
        };
        let lazy = matches!(kind, NodeKind::Lazy(_)).then_some(LazyState::Unexpanded);

        self.slots.push(Slot {
            name: String::new(),
            parent: None,
            children: Vec::new(),
            kind,
            attrs,
            callbacks,
            state,
            lazy,
            outcome: None,
            killed: false,
            generation: 0,
        });

        for (name, child) in children {
            let child_id = self.create(child);
            self.link(id, name, child_id);
        }

        id
    }

    fn link(&mut self, parent: NodeId, name: String, child: NodeId) {
        let slot = self.slot_mut(child);
        slot.name = name;
        slot.parent = Some(parent);
        self.slot_mut(parent).children.push(child);
    }

    /// Attach a parentless node under `parent`
    pub fn attach(&mut self, parent: NodeId, name: &str, child: NodeId) -> Result<(), TreeError> {
        validate_name(name)?;

        if !self.slot(parent).kind.is_group() {
            return Err(TreeError::NotAContainer {
                path: self.path(parent),
            });
        }

        if child == self.root() || self.slot(child).parent.is_some() {
            let existing = self
                .slot(child)
                .parent
                .map(|p| self.path(p))
                .unwrap_or_else(|| PATH_SEPARATOR.to_string());
            return Err(TreeError::Attachment {
                parent: existing,
                name: name.to_string(),
            });
        }

        // `child` must not be `parent` or one of its ancestors
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(TreeError::Attachment {
                    parent: self.path(parent),
                    name: name.to_string(),
                });
            }
            cursor = self.slot(id).parent;
        }

        if self.child(parent, name).is_some() {
            return Err(TreeError::DuplicateName {
                parent: self.path(parent),
                name: name.to_string(),
            });
        }

        self.link(parent, name.to_string(), child);
        Ok(())
    }

    /// Create `node` and attach it under `parent`
    pub fn graft(&mut self, parent: NodeId, name: &str, node: Node) -> Result<NodeId, TreeError> {
        let id = self.create(node);
        self.attach(parent, name, id)?;
        Ok(id)
    }

    /// Replace the Lazy node `id` in place by `node`.
    ///
    /// `id` keeps its name, path, skip flag and reuse annotation; it adopts the
    /// returned variant and children. Returns the number of spliced children.
    pub(crate) fn splice(&mut self, id: NodeId, node: Node) -> usize {
        let Node {
            kind,
            attrs,
            callbacks,
            children,
        } = node;

        let slot = self.slot_mut(id);
        slot.lazy = Some(if matches!(kind, NodeKind::Lazy(_)) {
            LazyState::Unexpanded
        } else {
            LazyState::Expanded
        });
        slot.kind = kind;
        if attrs.image.is_some() {
            slot.attrs.image = attrs.image;
        }
        slot.attrs.env.extend(attrs.env);
        if slot.attrs.doc.is_none() {
            slot.attrs.doc = attrs.doc;
        }
        slot.attrs.resources = attrs.resources.inherit_from(&slot.attrs.resources);
        slot.attrs.stop_on_error = attrs.stop_on_error;
        slot.callbacks.extend(callbacks);

        let count = children.len();
        for (name, child) in children {
            let child_id = self.create(child);
            self.link(id, name, child_id);
        }
        count
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.slot(id).name
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.slot(id).parent
    }

    /// Children in insertion order
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.slot(id).children
    }

    pub fn child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.slot(id)
            .children
            .iter()
            .copied()
            .find(|c| self.slot(*c).name == name)
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.slot(id).kind
    }

    pub fn attrs(&self, id: NodeId) -> &NodeAttrs {
        &self.slot(id).attrs
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        self.slot(id).state
    }

    pub fn lazy_state(&self, id: NodeId) -> Option<LazyState> {
        self.slot(id).lazy
    }

    pub fn outcome(&self, id: NodeId) -> Option<&Outcome> {
        self.slot(id).outcome.as_ref()
    }

    /// Slash-joined names from the root; the root itself is `/`
    pub fn path(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if names.len() > self.slots.len() {
                break;
            }
            let slot = self.slot(current);
            if slot.parent.is_some() {
                names.push(slot.name.as_str());
            }
            cursor = slot.parent;
        }

        if names.is_empty() {
            return PATH_SEPARATOR.to_string();
        }
        let mut path = String::new();
        for name in names.iter().rev() {
            path.push(PATH_SEPARATOR);
            path.push_str(name);
        }
        path
    }

    /// Resolve a path (leading `/` optional) from the root
    pub fn lookup(&self, path: &str) -> Result<NodeId, TreeError> {
        let mut cursor = self.root();
        for segment in split_path(path) {
            cursor = self
                .child(cursor, segment)
                .ok_or_else(|| TreeError::PathNotFound {
                    path: path.to_string(),
                    segment: segment.to_string(),
                })?;
        }
        Ok(cursor)
    }

    /// `id` and every node below it, parents before children
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.slot(current).children.iter().rev().copied());
        }
        out
    }

    /// Every attached node in pre-order
    pub fn preorder(&self) -> Vec<NodeId> {
        self.descendants(self.root())
    }

    /// Ancestors of `id`, nearest first
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.slot(id).parent;
        while let Some(current) = cursor {
            if out.len() > self.slots.len() {
                break;
            }
            out.push(current);
            cursor = self.slot(current).parent;
        }
        out
    }

    /// Environment merged from the root down; nearer nodes win
    pub fn effective_env(&self, id: NodeId) -> BTreeMap<String, String> {
        let mut chain = self.ancestors(id);
        chain.reverse();
        chain.push(id);

        let mut env = BTreeMap::new();
        for node in chain {
            for (k, v) in &self.slot(node).attrs.env {
                env.insert(k.clone(), v.clone());
            }
        }
        env
    }

    /// Nearest image reference on the ancestor chain
    pub fn effective_image(&self, id: NodeId) -> Option<ImageRef> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find_map(|node| self.slot(node).attrs.image.clone())
    }

    pub fn effective_resources(&self, id: NodeId) -> Resources {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .fold(Resources::default(), |acc, node| {
                acc.inherit_from(&self.slot(node).attrs.resources)
            })
    }

    /// Indented rendering of the tree with a per-node annotation
    pub fn render<F>(&self, annotate: F) -> String
    where
        F: Fn(NodeId) -> String,
    {
        let mut out = String::new();
        let root = self.root();
        let _ = writeln!(out, "/ {}", annotate(root));
        self.render_children(root, "", &annotate, &mut out);
        out
    }

    fn render_children<F>(&self, id: NodeId, prefix: &str, annotate: &F, out: &mut String)
    where
        F: Fn(NodeId) -> String,
    {
        let children = self.children(id);
        for (i, child) in children.iter().enumerate() {
            let last = i + 1 == children.len();
            let branch = if last { "└── " } else { "├── " };
            let _ = writeln!(
                out,
                "{}{}{} {}",
                prefix,
                branch,
                self.name(*child),
                annotate(*child)
            );
            let next = format!("{}{}", prefix, if last { "    " } else { "│   " });
            self.render_children(*child, &next, annotate, out);
        }
    }
}

impl From<Node> for Tree {
    fn from(root: Node) -> Self {
        Tree::new(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tree {
        let mut root = Node::serial().with_image("foo").with_env("A", "root");
        let together = root.add("all together", Node::parallel()).unwrap();
        together
            .add("a", Node::exec("echo a").with_image("bar"))
            .unwrap();
        together.add("b", Node::exec("echo b")).unwrap();
        let one = root
            .add("one at a time", Node::serial().with_image("bar").with_env("A", "group"))
            .unwrap();
        one.add("c", Node::exec("echo c").with_env("B", "leaf")).unwrap();
        one.add("d", Node::exec("echo d").with_skip(true)).unwrap();
        Tree::new(root)
    }

    #[test]
    fn test_paths_and_lookup() {
        let tree = sample();
        let c = tree.lookup("/one at a time/c").unwrap();
        assert_eq!(tree.path(c), "/one at a time/c");
        assert_eq!(tree.path(tree.root()), "/");
        assert_eq!(tree.lookup("/").unwrap(), tree.root());
        assert_eq!(tree.lookup("all together/b").map(|id| tree.name(id)).unwrap(), "b");

        let err = tree.lookup("/one at a time/zzz").unwrap_err();
        assert!(matches!(err, TreeError::PathNotFound { segment, .. } if segment == "zzz"));
    }

    #[test]
    fn test_initial_states() {
        let tree = sample();
        let d = tree.lookup("/one at a time/d").unwrap();
        let c = tree.lookup("/one at a time/c").unwrap();
        assert_eq!(tree.state(d), NodeState::Skipped);
        assert_eq!(tree.state(c), NodeState::Pending);
    }

    #[test]
    fn test_inherited_image_and_env() {
        let tree = sample();
        let a = tree.lookup("/all together/a").unwrap();
        let b = tree.lookup("/all together/b").unwrap();
        let c = tree.lookup("/one at a time/c").unwrap();

        assert_eq!(tree.effective_image(a).unwrap().as_str(), "bar");
        assert_eq!(tree.effective_image(b).unwrap().as_str(), "foo");
        assert_eq!(tree.effective_image(c).unwrap().as_str(), "bar");

        let env = tree.effective_env(c);
        assert_eq!(env.get("A").map(String::as_str), Some("group"));
        assert_eq!(env.get("B").map(String::as_str), Some("leaf"));
        assert_eq!(tree.effective_env(b).get("A").map(String::as_str), Some("root"));
    }

    #[test]
    fn test_attach_rules() {
        let mut tree = sample();
        let root = tree.root();
        let loose = tree.create(Node::exec("echo loose"));

        tree.attach(root, "loose", loose).unwrap();
        assert_eq!(tree.path(loose), "/loose");

        // already has a parent
        let group = tree.lookup("/all together").unwrap();
        let err = tree.attach(group, "again", loose).unwrap_err();
        assert!(matches!(err, TreeError::Attachment { parent, .. } if parent == "/"));

        // duplicate sibling name
        let other = tree.create(Node::exec("echo other"));
        let err = tree.attach(root, "loose", other).unwrap_err();
        assert!(matches!(err, TreeError::DuplicateName { .. }));

        // root cannot be re-attached
        let err = tree.attach(group, "root", root).unwrap_err();
        assert!(matches!(err, TreeError::Attachment { .. }));

        // leaves hold no children
        let err = tree.attach(loose, "x", other).unwrap_err();
        assert!(matches!(err, TreeError::NotAContainer { .. }));
    }

    #[test]
    fn test_attach_rejects_cycles() {
        let mut tree = Tree::new(Node::serial());
        let outer = tree.create(Node::serial());
        let inner = tree.graft(outer, "inner", Node::parallel()).unwrap();

        let err = tree.attach(inner, "outer", outer).unwrap_err();
        assert!(matches!(err, TreeError::Attachment { .. }));
    }

    #[test]
    fn test_preorder_follows_insertion_order() {
        let tree = sample();
        let names: Vec<&str> = tree
            .preorder()
            .into_iter()
            .map(|id| tree.name(id))
            .collect();
        assert_eq!(
            names,
            vec!["", "all together", "a", "b", "one at a time", "c", "d"]
        );
    }

    #[test]
    fn test_splice_keeps_identity() {
        let mut root = Node::serial();
        root.add(
            "gen",
            Node::lazy(|_| Ok(Node::serial())).with_env("K", "lazy"),
        )
        .unwrap();
        let mut tree = Tree::new(root);
        let id = tree.lookup("/gen").unwrap();
        assert_eq!(tree.lazy_state(id), Some(LazyState::Unexpanded));

        let mut generated = Node::parallel().with_env("K", "generated").with_image("img");
        generated.add("x", Node::exec("echo x")).unwrap();
        generated.add("y", Node::exec("echo y")).unwrap();

        assert_eq!(tree.splice(id, generated), 2);
        assert!(matches!(tree.kind(id), NodeKind::Parallel));
        assert_eq!(tree.lazy_state(id), Some(LazyState::Expanded));
        assert_eq!(tree.path(tree.lookup("/gen/y").unwrap()), "/gen/y");
        assert_eq!(tree.attrs(id).env.get("K").map(String::as_str), Some("generated"));
        assert_eq!(tree.effective_image(id).unwrap().as_str(), "img");
    }

    #[test]
    fn test_render() {
        let tree = sample();
        let text = tree.render(|id| tree.kind(id).label().to_string());
        assert!(text.starts_with("/ serial\n"));
        assert!(text.contains("├── all together parallel"));
        assert!(text.contains("    └── d exec"));
    }
}
