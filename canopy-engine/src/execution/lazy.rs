// Lazy Expansion
// UNEXPANDED → EXPANDING → EXPANDED | EXPAND_FAILED, and the splice into the live tree

use crate::error::ExpansionError;
use crate::execution::scope::ScopeId;
use crate::execution::state::LazyState;
use crate::store::DataStore;
use crate::tree::{LazyGenerator, Node, NodeId, NodeKind, Tree};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

/// What a Lazy generator sees when it is invoked
#[derive(Clone)]
pub struct LazyContext {
    /// Path of the Lazy node; every generated node lives below it
    pub path: String,
    pub args: Vec<String>,
    pub run_id: String,
    /// Scope the Lazy node resolves to
    pub scope: ScopeId,
    /// Runtime directory backing that scope, when the runtime has one
    pub workspace: Option<PathBuf>,
    pub store: Option<Arc<dyn DataStore>>,
}

impl LazyContext {
    pub fn store(&self) -> Option<&dyn DataStore> {
        self.store.as_deref()
    }
}

/// Move `id` from UNEXPANDED to EXPANDING.
///
/// Returns the generator to invoke, or `None` if the node is not an
/// unexpanded Lazy node (so a generator is never invoked twice).
pub(crate) fn begin(tree: &mut Tree, id: NodeId) -> Option<LazyGenerator> {
    let slot = tree.slot_mut(id);
    match (&slot.kind, slot.lazy) {
        (NodeKind::Lazy(generator), Some(LazyState::Unexpanded)) => {
            let generator = generator.clone();
            slot.lazy = Some(LazyState::Expanding);
            Some(generator)
        }
        _ => None,
    }
}

/// Record the generator's outcome for a node in EXPANDING.
///
/// On success the returned node is spliced in place and the number of new
/// children is returned.
pub(crate) fn complete(
    tree: &mut Tree,
    id: NodeId,
    result: Result<Node, ExpansionError>,
) -> Result<usize, ExpansionError> {
    match result {
        Ok(node) => Ok(tree.splice(id, node)),
        Err(err) => {
            tree.slot_mut(id).lazy = Some(LazyState::ExpandFailed);
            Err(err)
        }
    }
}

/// Let a failed expansion be attempted again after RESET
pub(crate) fn rearm(tree: &mut Tree, id: NodeId) {
    let slot = tree.slot_mut(id);
    if slot.lazy == Some(LazyState::ExpandFailed) {
        slot.lazy = Some(LazyState::Unexpanded);
    }
}

/// Invoke a generator on the blocking pool
pub(crate) async fn expand(
    generator: LazyGenerator,
    ctx: LazyContext,
) -> Result<Node, ExpansionError> {
    let joined = tokio::task::spawn_blocking(move || {
        catch_unwind(AssertUnwindSafe(|| (generator.func)(&ctx)))
    })
    .await;

    match joined {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ExpansionError::new("generator panicked")),
        Err(err) => Err(ExpansionError::new(format!("generator task failed: {}", err))),
    }
}
