// Container Scope Resolver
// Maps Exec leaves to container-reuse scopes from ancestor reuse annotations

use crate::error::{EngineError, EngineResult};
use crate::tree::{ContainerReuse, NodeId, NodeKind, Tree};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque reuse key handed to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a scope is anchored
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKey {
    /// The run-wide default scope
    Global,
    /// A fresh scope opened by the node at this path
    Anchored(String),
}

/// Walk from `id` towards the root and find the scope it belongs to.
///
/// - `NEW` anchors a fresh scope at that node.
/// - `GLOBAL` joins the run-wide default scope.
/// - `INHERIT` defers to the parent, except that a group or Lazy node
///   directly under an unannotated root anchors its own scope.
/// - An unannotated root (and so any leaf directly under it) is global.
pub fn scope_key(tree: &Tree, id: NodeId) -> EngineResult<ScopeKey> {
    let root = tree.root();
    let root_inherits = tree.attrs(root).reuse == ContainerReuse::Inherit;
    let mut current = id;

    for _ in 0..=tree.len() {
        match tree.attrs(current).reuse {
            ContainerReuse::New => return Ok(ScopeKey::Anchored(tree.path(current))),
            ContainerReuse::Global => return Ok(ScopeKey::Global),
            ContainerReuse::Inherit => {}
        }

        match tree.parent(current) {
            None if current == root => return Ok(ScopeKey::Global),
            None => {
                return Err(EngineError::AmbiguousScope {
                    path: tree.path(id),
                    reason: "node is not attached to the run tree".to_string(),
                })
            }
            Some(parent) => {
                // a Lazy splice point keeps its anchor whatever replaced it
                let group_like =
                    tree.kind(current).is_group() || tree.lazy_state(current).is_some();
                if parent == root && root_inherits && group_like {
                    return Ok(ScopeKey::Anchored(tree.path(current)));
                }
                current = parent;
            }
        }
    }

    Err(EngineError::AmbiguousScope {
        path: tree.path(id),
        reason: "ancestor chain does not terminate".to_string(),
    })
}

/// Run-scoped table of scope assignments.
///
/// One table exists per run so concurrent runs never share scopes.
#[derive(Debug, Clone)]
pub struct ScopeTable {
    run_id: String,
    scopes: BTreeMap<ScopeKey, ScopeId>,
    leaves: BTreeMap<NodeId, ScopeId>,
}

impl ScopeTable {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            scopes: BTreeMap::new(),
            leaves: BTreeMap::new(),
        }
    }

    /// Identifier for a scope key; depends only on the run id and tree shape
    pub fn id_for(&self, key: &ScopeKey) -> ScopeId {
        match key {
            ScopeKey::Global => ScopeId(format!("{}:global", self.run_id)),
            ScopeKey::Anchored(path) => ScopeId(format!("{}:{}", self.run_id, path)),
        }
    }

    /// Scope of `id`, assigning it on first use
    pub fn resolve(&mut self, tree: &Tree, id: NodeId) -> EngineResult<ScopeId> {
        if let Some(scope) = self.leaves.get(&id) {
            return Ok(scope.clone());
        }
        let key = scope_key(tree, id)?;
        let scope = match self.scopes.get(&key) {
            Some(scope) => scope.clone(),
            None => {
                let scope = self.id_for(&key);
                self.scopes.insert(key, scope.clone());
                scope
            }
        };
        self.leaves.insert(id, scope.clone());
        Ok(scope)
    }

    /// Scope already assigned to `id`, if it has been dispatched
    pub fn assigned(&self, id: NodeId) -> Option<&ScopeId> {
        self.leaves.get(&id)
    }

    /// Every scope opened so far
    pub fn scopes(&self) -> impl Iterator<Item = (&ScopeKey, &ScopeId)> {
        self.scopes.iter()
    }

    /// Resolve every attached Exec leaf without recording anything
    pub fn preview(&self, tree: &Tree) -> EngineResult<Vec<(NodeId, ScopeId)>> {
        tree.preorder()
            .into_iter()
            .filter(|id| matches!(tree.kind(*id), NodeKind::Exec(_)))
            .map(|id| Ok((id, self.id_for(&scope_key(tree, id)?))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Node;

    fn leaf(cmd: &str) -> Node {
        Node::exec(cmd)
    }

    fn scope(table: &mut ScopeTable, tree: &Tree, path: &str) -> ScopeId {
        let id = tree.lookup(path).unwrap();
        table.resolve(tree, id).unwrap()
    }

    #[test]
    fn test_leaves_in_unannotated_serial_share_scope() {
        let mut root = Node::serial();
        let group = root.add("group", Node::serial()).unwrap();
        group.add("1", leaf("inc")).unwrap();
        group.add("2", leaf("inc")).unwrap();
        group
            .add("3", leaf("inc").with_reuse(ContainerReuse::New))
            .unwrap();
        let tree = Tree::new(root);
        let mut table = ScopeTable::new("run");

        let one = scope(&mut table, &tree, "/group/1");
        let two = scope(&mut table, &tree, "/group/2");
        let three = scope(&mut table, &tree, "/group/3");
        assert_eq!(one, two);
        assert_ne!(two, three);
        assert_eq!(one.as_str(), "run:/group");
        assert_eq!(three.as_str(), "run:/group/3");
    }

    #[test]
    fn test_top_level_groups_do_not_share() {
        let mut root = Node::serial().with_stop_on_error(false);
        root.add("first unset", Node::serial())
            .unwrap()
            .add("1", leaf("inc"))
            .unwrap();
        root.add("second unset", Node::serial())
            .unwrap()
            .add("1", leaf("inc"))
            .unwrap();
        let tree = Tree::new(root);
        let mut table = ScopeTable::new("run");

        assert_ne!(
            scope(&mut table, &tree, "/first unset/1"),
            scope(&mut table, &tree, "/second unset/1")
        );
    }

    #[test]
    fn test_nested_groups_inherit_enclosing_scope() {
        let mut root = Node::parallel();
        let outer = root.add("outer", Node::serial()).unwrap();
        outer.add("a", leaf("inc")).unwrap();
        outer
            .add("inner", Node::parallel())
            .unwrap()
            .add("b", leaf("inc"))
            .unwrap();
        let tree = Tree::new(root);
        let mut table = ScopeTable::new("run");

        assert_eq!(
            scope(&mut table, &tree, "/outer/a"),
            scope(&mut table, &tree, "/outer/inner/b")
        );
    }

    #[test]
    fn test_global_escapes_new_ancestor() {
        let mut root = Node::parallel();
        root.add("top", leaf("inc")).unwrap();
        let local = root
            .add("local", Node::serial().with_reuse(ContainerReuse::New))
            .unwrap();
        local.add("1", leaf("inc")).unwrap();
        local
            .add(
                "nested global",
                Node::serial().with_reuse(ContainerReuse::Global),
            )
            .unwrap()
            .add("deep", Node::serial())
            .unwrap()
            .add("1", leaf("inc"))
            .unwrap();
        root.add("elsewhere", Node::parallel())
            .unwrap()
            .add("g", leaf("inc").with_reuse(ContainerReuse::Global))
            .unwrap();
        let tree = Tree::new(root);
        let mut table = ScopeTable::new("run");

        let top = scope(&mut table, &tree, "/top");
        let deep = scope(&mut table, &tree, "/local/nested global/deep/1");
        let elsewhere = scope(&mut table, &tree, "/elsewhere/g");
        let local = scope(&mut table, &tree, "/local/1");

        assert_eq!(top.as_str(), "run:global");
        assert_eq!(deep, elsewhere);
        assert_eq!(deep, top);
        assert_ne!(local, deep);
    }

    #[test]
    fn test_annotated_root_covers_top_level_groups() {
        let mut root = Node::serial().with_reuse(ContainerReuse::New);
        root.add("a", Node::serial())
            .unwrap()
            .add("1", leaf("inc"))
            .unwrap();
        root.add("b", Node::serial())
            .unwrap()
            .add("1", leaf("inc"))
            .unwrap();
        let tree = Tree::new(root);
        let mut table = ScopeTable::new("run");

        let a = scope(&mut table, &tree, "/a/1");
        assert_eq!(a, scope(&mut table, &tree, "/b/1"));
        assert_eq!(a.as_str(), "run:/");
    }

    #[test]
    fn test_resolution_is_idempotent_and_matches_preview() {
        let mut root = Node::serial();
        let group = root.add("g", Node::parallel()).unwrap();
        group.add("x", leaf("inc")).unwrap();
        group
            .add("y", leaf("inc").with_reuse(ContainerReuse::New))
            .unwrap();
        root.add("z", leaf("inc")).unwrap();
        let tree = Tree::new(root);

        let mut table = ScopeTable::new("run");
        let preview = table.preview(&tree).unwrap();
        for (id, expected) in &preview {
            assert_eq!(&table.resolve(&tree, *id).unwrap(), expected);
            assert_eq!(&table.resolve(&tree, *id).unwrap(), expected);
        }
        assert_eq!(preview.len(), 3);

        // a second table over the same shape yields the same grouping
        let mut again = ScopeTable::new("run");
        for (id, expected) in &preview {
            assert_eq!(&again.resolve(&tree, *id).unwrap(), expected);
        }
    }

    #[test]
    fn test_lazy_splice_point_keeps_its_anchor() {
        let mut root = Node::serial();
        root.add("gen", Node::lazy(|_| Ok(Node::serial()))).unwrap();
        let mut tree = Tree::new(root);
        let id = tree.lookup("/gen").unwrap();

        let before = scope_key(&tree, id).unwrap();
        tree.splice(id, leaf("inc"));
        let mut table = ScopeTable::new("run");

        assert_eq!(scope_key(&tree, id).unwrap(), before);
        assert_eq!(scope(&mut table, &tree, "/gen").as_str(), "run:/gen");
    }

    #[test]
    fn test_detached_node_is_ambiguous() {
        let mut tree = Tree::new(Node::serial());
        let loose = tree.create(leaf("inc"));
        let mut table = ScopeTable::new("run");

        let err = table.resolve(&tree, loose).unwrap_err();
        assert!(matches!(err, EngineError::AmbiguousScope { .. }));
    }

    #[test]
    fn test_scope_ids_are_run_scoped() {
        let mut root = Node::serial();
        root.add("a", leaf("inc")).unwrap();
        let tree = Tree::new(root);
        let id = tree.lookup("/a").unwrap();

        let first = ScopeTable::new("run-1").resolve(&tree, id).unwrap();
        let second = ScopeTable::new("run-2").resolve(&tree, id).unwrap();
        assert_ne!(first, second);
    }
}
