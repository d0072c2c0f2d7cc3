// Run Report
// Inspectable summary of a run: per-node states, scopes and failures

use crate::execution::scope::ScopeTable;
use crate::execution::state::{LazyState, NodeState};
use crate::tree::{NodeKind, Tree};

use serde::Serialize;
use std::time::Duration;

/// Where a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Nonzero exit or raised error in an Exec leaf
    Leaf,
    /// A Lazy generator failed
    Expansion,
}

/// A node that ended in ERROR on its own account
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub path: String,
    pub kind: FailureKind,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

/// State of a single node at report time
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub path: String,
    pub kind: &'static str,
    pub state: NodeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lazy: Option<LazyState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Result of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    /// Aggregate root state; the single source of truth for success
    pub state: NodeState,
    pub duration: Duration,
    /// Every attached node in pre-order
    pub nodes: Vec<NodeReport>,
    pub failures: Vec<Failure>,
}

impl RunReport {
    pub(crate) fn build(tree: &Tree, scopes: &ScopeTable, run_id: &str, duration: Duration) -> Self {
        let mut nodes = Vec::new();
        let mut failures = Vec::new();

        for id in tree.preorder() {
            let path = tree.path(id);
            let state = tree.state(id);
            let outcome = tree.outcome(id);

            if state == NodeState::Error {
                let kind = match (tree.kind(id), tree.lazy_state(id)) {
                    (NodeKind::Exec(_), _) => Some(FailureKind::Leaf),
                    (_, Some(LazyState::ExpandFailed)) => Some(FailureKind::Expansion),
                    _ => None,
                };
                if let Some(kind) = kind {
                    failures.push(Failure {
                        path: path.clone(),
                        kind,
                        exit_code: outcome.and_then(|o| o.exit_code),
                        message: outcome.and_then(|o| o.message.clone()),
                    });
                }
            }

            nodes.push(NodeReport {
                path,
                kind: tree.kind(id).label(),
                state,
                lazy: tree.lazy_state(id),
                scope: scopes.assigned(id).map(|s| s.to_string()),
                exit_code: outcome.and_then(|o| o.exit_code),
            });
        }

        Self {
            run_id: run_id.to_string(),
            state: tree.state(tree.root()),
            duration,
            nodes,
            failures,
        }
    }

    /// The run succeeded iff the root is DONE
    pub fn succeeded(&self) -> bool {
        self.state == NodeState::Done
    }

    pub fn node(&self, path: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.path == path)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Node, Outcome};

    #[test]
    fn test_failures_are_collected() {
        let mut root = Node::serial();
        root.add("bad", Node::exec("exit 2")).unwrap();
        root.add("gen", Node::lazy(|_| Ok(Node::serial()))).unwrap();
        root.add("after", Node::exec("echo")).unwrap();
        let mut tree = Tree::new(root);

        let bad = tree.lookup("/bad").unwrap();
        tree.slot_mut(bad).state = NodeState::Error;
        tree.slot_mut(bad).outcome = Some(Outcome {
            exit_code: Some(2),
            message: Some("exit 2".to_string()),
        });
        let gen = tree.lookup("/gen").unwrap();
        tree.slot_mut(gen).state = NodeState::Error;
        tree.slot_mut(gen).lazy = Some(LazyState::ExpandFailed);
        let root_id = tree.root();
        tree.slot_mut(root_id).state = NodeState::Error;

        let report = RunReport::build(&tree, &ScopeTable::new("run"), "run", Duration::ZERO);
        assert!(!report.succeeded());
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].path, "/bad");
        assert_eq!(report.failures[0].kind, FailureKind::Leaf);
        assert_eq!(report.failures[0].exit_code, Some(2));
        assert_eq!(report.failures[1].kind, FailureKind::Expansion);
        assert_eq!(report.node("/after").unwrap().state, NodeState::Pending);
        assert_eq!(report.nodes.len(), 4);
    }

    #[test]
    fn test_json_output() {
        let tree = Tree::new(Node::parallel());
        let report = RunReport::build(&tree, &ScopeTable::new("run"), "run", Duration::ZERO);
        let json = report.to_json().unwrap();
        assert!(json.contains("\"state\": \"PENDING\""));
        assert!(json.contains("\"run_id\": \"run\""));
    }
}
