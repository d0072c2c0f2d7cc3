// Mock Runtime
// Deterministic scripted runtime for exercising the scheduler without processes

use crate::execution::scope::ScopeId;
use crate::runners::{
    run_callable, LeafExit, LeafStatus, LeafTask, Runtime, RuntimeError, RuntimeHandle,
};
use crate::tree::{Command, ImageRef, Resources};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// One recorded call to `start`
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub path: String,
    pub scope: ScopeId,
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub image: Option<ImageRef>,
    pub resources: Resources,
}

#[derive(Debug)]
struct MockJob {
    path: String,
    exit: LeafExit,
    held: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    exits: HashMap<String, i32>,
    held_paths: HashSet<String>,
    start_failures: HashSet<String>,
    jobs: HashMap<u64, MockJob>,
    dispatches: Vec<Dispatch>,
    kills: Vec<String>,
}

/// Scripted runtime.
///
/// Shell commands of the form `exit N` finish with code N; anything else
/// succeeds unless a per-path exit code was set. Callables run inline at
/// `start`. Held paths stay RUNNING until released or killed.
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Force the exit code of the leaf at `path`
    pub fn with_exit(self, path: impl Into<String>, code: i32) -> Self {
        self.set_exit(path, code);
        self
    }

    pub fn set_exit(&self, path: impl Into<String>, code: i32) {
        self.state().exits.insert(path.into(), code);
    }

    /// Make `start` fail for the leaf at `path`
    pub fn fail_start(&self, path: impl Into<String>) {
        self.state().start_failures.insert(path.into());
    }

    /// Keep leaves at `path` running until [`MockRuntime::release`]
    pub fn hold(&self, path: impl Into<String>) {
        self.state().held_paths.insert(path.into());
    }

    /// Let held work at `path` finish
    pub fn release(&self, path: &str) {
        let mut state = self.state();
        state.held_paths.remove(path);
        for job in state.jobs.values_mut().filter(|j| j.path == path) {
            job.held = false;
        }
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.state().dispatches.clone()
    }

    /// Paths in dispatch order
    pub fn dispatched_paths(&self) -> Vec<String> {
        self.state()
            .dispatches
            .iter()
            .map(|d| d.path.clone())
            .collect()
    }

    pub fn dispatch_count(&self, path: &str) -> usize {
        self.state()
            .dispatches
            .iter()
            .filter(|d| d.path == path)
            .count()
    }

    /// Scope the most recent dispatch of `path` ran in
    pub fn scope_of(&self, path: &str) -> Option<ScopeId> {
        self.state()
            .dispatches
            .iter()
            .rev()
            .find(|d| d.path == path)
            .map(|d| d.scope.clone())
    }

    /// Paths whose work was killed
    pub fn kills(&self) -> Vec<String> {
        self.state().kills.clone()
    }

    /// Whether held work for `path` is currently in flight
    pub fn is_running(&self, path: &str) -> bool {
        self.state().jobs.values().any(|j| j.path == path)
    }
}

/// Exit code scripted by a shell command
fn scripted_exit(command: &str) -> i32 {
    command
        .trim()
        .strip_prefix("exit")
        .and_then(|rest| rest.trim().parse().ok())
        .unwrap_or(0)
}

#[async_trait::async_trait]
impl Runtime for MockRuntime {
    async fn start(&self, scope: &ScopeId, task: LeafTask) -> Result<RuntimeHandle, RuntimeError> {
        let mut state = self.state();
        if state.start_failures.contains(&task.path) {
            return Err(RuntimeError::StartFailed(format!(
                "scripted start failure for '{}'",
                task.path
            )));
        }

        state.dispatches.push(Dispatch {
            path: task.path.clone(),
            scope: scope.clone(),
            command: task.command.describe(),
            env: task.env.clone(),
            image: task.image.clone(),
            resources: task.resources,
        });

        let mut exit = match &task.command {
            Command::Shell(cmd) => match scripted_exit(cmd) {
                0 => LeafExit::success(),
                code => LeafExit::failure(code, format!("exit {}", code)),
            },
            Command::Callable { func, .. } => {
                let func = func.clone();
                let ctx = task.context(scope);
                // the callable may touch shared state; do not hold the lock
                drop(state);
                let exit = run_callable(&func, &ctx);
                state = self.state();
                exit
            }
        };
        if let Some(code) = state.exits.get(&task.path).copied() {
            exit = if code == 0 {
                LeafExit::success()
            } else {
                LeafExit::failure(code, format!("exit {}", code))
            };
        }

        state.next_id += 1;
        let id = state.next_id;
        let held = state.held_paths.contains(&task.path);
        state.jobs.insert(
            id,
            MockJob {
                path: task.path,
                exit,
                held,
            },
        );

        Ok(RuntimeHandle {
            id,
            scope: scope.clone(),
        })
    }

    async fn poll(&self, handle: &RuntimeHandle) -> Result<LeafStatus, RuntimeError> {
        let mut state = self.state();
        let job = state
            .jobs
            .get(&handle.id)
            .ok_or(RuntimeError::UnknownHandle(handle.id))?;
        if job.held {
            return Ok(LeafStatus::Running);
        }
        match state.jobs.remove(&handle.id) {
            Some(job) => Ok(LeafStatus::Exited(job.exit)),
            None => Err(RuntimeError::UnknownHandle(handle.id)),
        }
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        let mut state = self.state();
        let path = match state.jobs.get_mut(&handle.id) {
            Some(job) => {
                job.held = false;
                job.exit = LeafExit::failure(-1, "killed");
                job.path.clone()
            }
            None => return Err(RuntimeError::UnknownHandle(handle.id)),
        };
        state.kills.push(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(path: &str, cmd: &str) -> LeafTask {
        LeafTask {
            path: path.to_string(),
            command: Command::Shell(cmd.to_string()),
            env: BTreeMap::new(),
            image: None,
            resources: Resources::default(),
            store: None,
        }
    }

    #[test]
    fn test_scripted_exit() {
        assert_eq!(scripted_exit("exit 1"), 1);
        assert_eq!(scripted_exit("  exit 42 "), 42);
        assert_eq!(scripted_exit("echo ok"), 0);
        assert_eq!(scripted_exit("exit"), 0);
    }

    #[tokio::test]
    async fn test_scripted_and_overridden_exits() {
        let runtime = MockRuntime::new().with_exit("/forced", 7);
        let scope = ScopeId::new("run:global");

        let failing = runtime.start(&scope, task("/a", "exit 1")).await.unwrap();
        let forced = runtime.start(&scope, task("/forced", "echo")).await.unwrap();

        assert_eq!(
            runtime.poll(&failing).await.unwrap(),
            LeafStatus::Exited(LeafExit::failure(1, "exit 1"))
        );
        match runtime.poll(&forced).await.unwrap() {
            LeafStatus::Exited(exit) => assert_eq!(exit.code, 7),
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(runtime.dispatched_paths(), vec!["/a", "/forced"]);
        assert_eq!(runtime.scope_of("/a"), Some(scope));
    }

    #[tokio::test]
    async fn test_hold_release_and_kill() {
        let runtime = MockRuntime::new();
        let scope = ScopeId::new("run:global");
        runtime.hold("/slow");

        let first = runtime.start(&scope, task("/slow", "echo")).await.unwrap();
        assert_eq!(runtime.poll(&first).await.unwrap(), LeafStatus::Running);
        assert!(runtime.is_running("/slow"));
        runtime.release("/slow");
        assert_eq!(
            runtime.poll(&first).await.unwrap(),
            LeafStatus::Exited(LeafExit::success())
        );

        runtime.hold("/slow");
        let second = runtime.start(&scope, task("/slow", "echo")).await.unwrap();
        runtime.kill(&second).await.unwrap();
        assert!(matches!(
            runtime.poll(&second).await.unwrap(),
            LeafStatus::Exited(exit) if !exit.succeeded()
        ));
        assert_eq!(runtime.kills(), vec!["/slow"]);
    }

    #[tokio::test]
    async fn test_start_failure() {
        let runtime = MockRuntime::new();
        runtime.fail_start("/broken");
        let err = runtime
            .start(&ScopeId::new("s"), task("/broken", "echo"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::StartFailed(_)));
        assert!(runtime.dispatches().is_empty());
    }
}
