// Runners Module
// Runtime collaborator interface and the bundled local, docker and mock runtimes

pub mod docker;
pub mod local;
pub mod mock;

// Re-export key types
pub use docker::{ContainerConfig, DockerRuntime, ImagePullPolicy};
pub use local::{LocalRuntime, LocalRuntimeConfig, Shell};
pub use mock::{Dispatch, MockRuntime};

use crate::execution::scope::ScopeId;
use crate::store::DataStore;
use crate::tree::{Command, ImageRef, LeafFn, Resources};

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Errors reported by a runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("failed to start leaf: {0}")]
    StartFailed(String),

    #[error("unknown runtime handle {0}")]
    UnknownHandle(u64),

    #[error("unsupported by this runtime: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a runtime needs to start one Exec leaf
#[derive(Clone)]
pub struct LeafTask {
    pub path: String,
    pub command: Command,
    /// Merged node env plus injected run variables
    pub env: BTreeMap<String, String>,
    pub image: Option<ImageRef>,
    pub resources: Resources,
    pub store: Option<Arc<dyn DataStore>>,
}

impl LeafTask {
    /// Context handed to a callable-backed leaf
    pub fn context(&self, scope: &ScopeId) -> LeafContext {
        let args = match &self.command {
            Command::Callable { args, .. } => args.clone(),
            Command::Shell(_) => Vec::new(),
        };
        LeafContext {
            path: self.path.clone(),
            args,
            env: self.env.clone(),
            scope: scope.clone(),
            store: self.store.clone(),
        }
    }
}

impl std::fmt::Debug for LeafTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafTask")
            .field("path", &self.path)
            .field("command", &self.command)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

/// What a callable-backed leaf sees while it runs
#[derive(Clone)]
pub struct LeafContext {
    pub path: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub scope: ScopeId,
    pub store: Option<Arc<dyn DataStore>>,
}

impl LeafContext {
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn store(&self) -> Option<&dyn DataStore> {
        self.store.as_deref()
    }
}

/// Opaque handle to in-flight leaf work
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuntimeHandle {
    pub id: u64,
    pub scope: ScopeId,
}

/// Exit status of finished leaf work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafExit {
    pub code: i32,
    pub message: Option<String>,
}

impl LeafExit {
    pub fn success() -> Self {
        Self {
            code: 0,
            message: None,
        }
    }

    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// Result of polling a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafStatus {
    /// Accepted but not yet started by the runtime
    Pending,
    Running,
    Exited(LeafExit),
}

/// Collaborator that actually executes Exec leaves.
///
/// The scope id is a reuse key: leaves with the same scope id expect to see
/// each other's filesystem effects.
#[async_trait::async_trait]
pub trait Runtime: Send + Sync {
    async fn start(&self, scope: &ScopeId, task: LeafTask) -> Result<RuntimeHandle, RuntimeError>;

    async fn poll(&self, handle: &RuntimeHandle) -> Result<LeafStatus, RuntimeError>;

    /// Advisory; work that cannot be interrupted may keep running
    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError>;

    /// Host directory backing a scope, if the runtime has one
    fn workspace(&self, _scope: &ScopeId) -> Option<PathBuf> {
        None
    }

    /// Release per-scope resources once the owner is done with the run
    async fn shutdown(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Run a leaf callable, mapping errors and panics to a failed exit
pub fn run_callable(func: &LeafFn, ctx: &LeafContext) -> LeafExit {
    match catch_unwind(AssertUnwindSafe(|| func(ctx))) {
        Ok(Ok(())) => LeafExit::success(),
        Ok(Err(err)) => LeafExit::failure(1, err.to_string()),
        Err(_) => LeafExit::failure(1, "callable panicked"),
    }
}

struct TaskEntry {
    task: JoinHandle<LeafExit>,
    kill: Option<oneshot::Sender<()>>,
}

/// In-flight background tasks keyed by handle id, shared by the process-based
/// runtimes
#[derive(Default)]
pub(crate) struct TaskTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, TaskEntry>>,
}

impl TaskTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<u64, TaskEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(
        &self,
        scope: &ScopeId,
        task: JoinHandle<LeafExit>,
        kill: Option<oneshot::Sender<()>>,
    ) -> RuntimeHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries().insert(id, TaskEntry { task, kill });
        RuntimeHandle {
            id,
            scope: scope.clone(),
        }
    }

    pub async fn poll(&self, handle: &RuntimeHandle) -> Result<LeafStatus, RuntimeError> {
        let finished = {
            let mut entries = self.entries();
            let entry = entries
                .get(&handle.id)
                .ok_or(RuntimeError::UnknownHandle(handle.id))?;
            if !entry.task.is_finished() {
                return Ok(LeafStatus::Running);
            }
            entries.remove(&handle.id)
        };

        match finished {
            Some(entry) => match entry.task.await {
                Ok(exit) => Ok(LeafStatus::Exited(exit)),
                Err(err) => Ok(LeafStatus::Exited(LeafExit::failure(
                    1,
                    format!("leaf task aborted: {}", err),
                ))),
            },
            None => Err(RuntimeError::UnknownHandle(handle.id)),
        }
    }

    /// Signal the task; returns false when it cannot be interrupted
    pub fn kill(&self, handle: &RuntimeHandle) -> Result<bool, RuntimeError> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(&handle.id)
            .ok_or(RuntimeError::UnknownHandle(handle.id))?;
        match entry.kill.take() {
            Some(tx) => Ok(tx.send(()).is_ok()),
            None => Ok(false),
        }
    }
}

/// Directory-safe form of a scope id
pub(crate) fn scope_dir_name(scope: &ScopeId) -> String {
    scope
        .as_str()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::LeafResult;

    #[test]
    fn test_run_callable_maps_failures() {
        let ctx = LeafContext {
            path: "/a".to_string(),
            args: vec!["x".to_string()],
            env: BTreeMap::new(),
            scope: ScopeId::new("run:global"),
            store: None,
        };

        let ok: LeafFn = Arc::new(|ctx: &LeafContext| -> LeafResult {
            assert_eq!(ctx.args, vec!["x".to_string()]);
            Ok(())
        });
        assert!(run_callable(&ok, &ctx).succeeded());

        let failing: LeafFn = Arc::new(|_: &LeafContext| -> LeafResult { Err("bad input".into()) });
        let exit = run_callable(&failing, &ctx);
        assert_eq!(exit.code, 1);
        assert_eq!(exit.message.as_deref(), Some("bad input"));

        let panicking: LeafFn = Arc::new(|_: &LeafContext| -> LeafResult { panic!("bug") });
        assert!(!run_callable(&panicking, &ctx).succeeded());
    }

    #[test]
    fn test_scope_dir_name() {
        let scope = ScopeId::new("run-1:/first group/a");
        assert_eq!(scope_dir_name(&scope), "run-1__first_group_a");
    }

    #[tokio::test]
    async fn test_task_table_lifecycle() {
        let table = TaskTable::default();
        let scope = ScopeId::new("s");
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = rx.await;
            LeafExit::failure(137, "killed")
        });
        let handle = table.insert(&scope, task, Some(tx));

        assert_eq!(table.poll(&handle).await.unwrap(), LeafStatus::Running);
        assert!(table.kill(&handle).unwrap());

        let status = loop {
            match table.poll(&handle).await.unwrap() {
                LeafStatus::Exited(exit) => break exit,
                _ => tokio::task::yield_now().await,
            }
        };
        assert_eq!(status.code, 137);
        assert!(matches!(
            table.poll(&handle).await,
            Err(RuntimeError::UnknownHandle(_))
        ));
    }
}
