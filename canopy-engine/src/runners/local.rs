// Local Runtime
// Runs leaves as host processes; each scope gets its own working directory

use crate::execution::scope::ScopeId;
use crate::runners::{
    run_callable, scope_dir_name, LeafExit, LeafStatus, LeafTask, Runtime, RuntimeError,
    RuntimeHandle, TaskTable,
};
use crate::tree::Command;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Shells the local runtime can launch commands with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shell {
    /// sh on Unix, cmd on Windows
    #[default]
    Default,
    Bash,
}

impl Shell {
    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
        }
    }
}

/// Configuration for the local runtime
#[derive(Debug, Clone)]
pub struct LocalRuntimeConfig {
    /// Parent directory of the per-scope working directories
    pub work_root: PathBuf,
    pub shell: Shell,
    /// Echo leaf output lines at debug level
    pub log_output: bool,
}

impl Default for LocalRuntimeConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("canopy"),
            shell: Shell::Default,
            log_output: true,
        }
    }
}

/// Host-process runtime.
///
/// Leaves sharing a scope id share a working directory, which stands in for
/// a reused container.
pub struct LocalRuntime {
    config: LocalRuntimeConfig,
    tasks: TaskTable,
    prepared: Mutex<HashSet<ScopeId>>,
}

impl LocalRuntime {
    /// Create a local runtime with default configuration
    pub fn new() -> Self {
        Self::with_config(LocalRuntimeConfig::default())
    }

    pub fn with_config(config: LocalRuntimeConfig) -> Self {
        Self {
            config,
            tasks: TaskTable::default(),
            prepared: Mutex::new(HashSet::new()),
        }
    }

    /// Working directory used for `scope`
    pub fn scope_dir(&self, scope: &ScopeId) -> PathBuf {
        self.config.work_root.join(scope_dir_name(scope))
    }

    async fn prepare_scope(&self, scope: &ScopeId) -> Result<PathBuf, RuntimeError> {
        let dir = self.scope_dir(scope);
        tokio::fs::create_dir_all(&dir).await?;

        let first = self
            .prepared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scope.clone());
        if first {
            debug!(scope = %scope, dir = %dir.display(), "prepared scope workspace");
        }
        Ok(dir)
    }

    fn spawn_shell(
        &self,
        script: &str,
        task: &LeafTask,
        work_dir: &Path,
    ) -> Result<(tokio::task::JoinHandle<LeafExit>, oneshot::Sender<()>), RuntimeError> {
        let (shell_cmd, shell_args) = self.config.shell.get_command();

        let mut cmd = tokio::process::Command::new(shell_cmd);
        cmd.args(shell_args);
        cmd.arg(script);
        cmd.current_dir(work_dir);
        cmd.envs(&task.env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            RuntimeError::StartFailed(format!(
                "failed to spawn shell process '{}': {}",
                shell_cmd, e
            ))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let path = task.path.clone();
        let log_output = self.config.log_output;
        let (kill_tx, kill_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let stdout_path = path.clone();
            let stdout_handle = tokio::spawn(async move {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if log_output {
                            debug!(path = %stdout_path, "{}", line);
                        }
                    }
                }
            });

            // keep the last stderr line as the failure message
            let stderr_path = path.clone();
            let stderr_handle = tokio::spawn(async move {
                let mut last = None;
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if log_output {
                            debug!(path = %stderr_path, stream = "stderr", "{}", line);
                        }
                        if !line.trim().is_empty() {
                            last = Some(line);
                        }
                    }
                }
                last
            });

            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code().unwrap_or(-1),
                    Err(e) => {
                        warn!(path = %path, error = %e, "failed to wait on leaf process");
                        -1
                    }
                },
                Ok(()) = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(path = %path, error = %e, "failed to kill leaf process");
                    }
                    return LeafExit::failure(-1, "killed");
                }
            };

            let _ = stdout_handle.await;
            let last_stderr = stderr_handle.await.unwrap_or_default();

            if exit == 0 {
                LeafExit::success()
            } else {
                LeafExit {
                    code: exit,
                    message: last_stderr,
                }
            }
        });

        Ok((handle, kill_tx))
    }
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Runtime for LocalRuntime {
    async fn start(&self, scope: &ScopeId, task: LeafTask) -> Result<RuntimeHandle, RuntimeError> {
        let work_dir = self.prepare_scope(scope).await?;
        debug!(path = %task.path, scope = %scope, command = %task.command.describe(), "starting leaf");

        match &task.command {
            Command::Shell(script) => {
                let (handle, kill) = self.spawn_shell(script, &task, &work_dir)?;
                Ok(self.tasks.insert(scope, handle, Some(kill)))
            }
            Command::Callable { func, .. } => {
                let func = func.clone();
                let ctx = task.context(scope);
                let handle = tokio::task::spawn_blocking(move || run_callable(&func, &ctx));
                Ok(self.tasks.insert(scope, handle, None))
            }
        }
    }

    async fn poll(&self, handle: &RuntimeHandle) -> Result<LeafStatus, RuntimeError> {
        self.tasks.poll(handle).await
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        if !self.tasks.kill(handle)? {
            debug!(handle = handle.id, "leaf cannot be interrupted; letting it finish");
        }
        Ok(())
    }

    fn workspace(&self, scope: &ScopeId) -> Option<PathBuf> {
        Some(self.scope_dir(scope))
    }
}
