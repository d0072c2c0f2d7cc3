// Docker Runtime
// One long-lived container per scope; each leaf is a `docker exec` into it

use crate::execution::scope::ScopeId;
use crate::runners::{
    run_callable, scope_dir_name, LeafExit, LeafStatus, LeafTask, Runtime, RuntimeError,
    RuntimeHandle, TaskTable,
};
use crate::tree::{Command, Resources};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// Configuration for container execution
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Image for leaves with no image reference on their ancestor chain
    pub default_image: String,
    /// Whether to pull images before creating a scope container
    pub pull_policy: ImagePullPolicy,
    /// Whether to remove scope containers at shutdown
    pub auto_remove: bool,
    /// Host directory whose per-scope subdirectories are mounted at /workspace
    pub work_root: PathBuf,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            default_image: "alpine:3".to_string(),
            pull_policy: ImagePullPolicy::IfNotPresent,
            auto_remove: true,
            work_root: std::env::temp_dir().join("canopy-docker"),
        }
    }
}

/// Image pull policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePullPolicy {
    /// Always pull the image
    Always,
    /// Pull only if not present locally
    IfNotPresent,
    /// Never pull (must be present locally)
    Never,
}

/// Handle to a running scope container
#[derive(Debug, Clone)]
struct ContainerHandle {
    id: String,
    name: String,
    image: String,
}

/// Runtime that maps every scope id onto one docker container
pub struct DockerRuntime {
    config: ContainerConfig,
    tasks: TaskTable,
    containers: Mutex<HashMap<ScopeId, ContainerHandle>>,
}

impl DockerRuntime {
    /// Create a docker runtime with default configuration
    pub fn new() -> Self {
        Self::with_config(ContainerConfig::default())
    }

    /// Create a docker runtime with custom configuration
    pub fn with_config(config: ContainerConfig) -> Self {
        Self {
            config,
            tasks: TaskTable::default(),
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Check if Docker is available
    pub async fn is_available(&self) -> bool {
        if which::which("docker").is_err() {
            return false;
        }
        let output = tokio::process::Command::new("docker")
            .arg("version")
            .arg("--format")
            .arg("{{.Server.Version}}")
            .output()
            .await;

        output.map(|o| o.status.success()).unwrap_or(false)
    }

    fn scope_dir(&self, scope: &ScopeId) -> PathBuf {
        self.config.work_root.join(scope_dir_name(scope))
    }

    /// Container for `scope`, created on first use
    async fn ensure_container(
        &self,
        scope: &ScopeId,
        task: &LeafTask,
    ) -> Result<ContainerHandle, RuntimeError> {
        let mut containers = self.containers.lock().await;
        if let Some(existing) = containers.get(scope) {
            if let Some(image) = &task.image {
                if image.as_str() != existing.image {
                    debug!(scope = %scope, wanted = %image, using = %existing.image, "scope container already running another image");
                }
            }
            return Ok(existing.clone());
        }

        let image = task
            .image
            .as_ref()
            .map(|i| i.as_str().to_string())
            .unwrap_or_else(|| self.config.default_image.clone());

        self.pull_image_if_needed(&image).await?;
        let handle = self.create_container(scope, &image, &task.resources).await?;
        info!(scope = %scope, container = %handle.name, image = %image, "started scope container");
        containers.insert(scope.clone(), handle.clone());
        Ok(handle)
    }

    /// Pull an image if needed based on pull policy
    async fn pull_image_if_needed(&self, image: &str) -> Result<(), RuntimeError> {
        match self.config.pull_policy {
            ImagePullPolicy::Never => Ok(()),
            ImagePullPolicy::Always => self.pull_image(image).await,
            ImagePullPolicy::IfNotPresent => {
                let output = tokio::process::Command::new("docker")
                    .args(["image", "inspect", image])
                    .output()
                    .await
                    .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

                if !output.status.success() {
                    self.pull_image(image).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let output = tokio::process::Command::new("docker")
            .args(["pull", image])
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::StartFailed(format!(
                "failed to pull {}: {}",
                image,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn create_container(
        &self,
        scope: &ScopeId,
        image: &str,
        resources: &Resources,
    ) -> Result<ContainerHandle, RuntimeError> {
        let work_dir = self.scope_dir(scope);
        tokio::fs::create_dir_all(&work_dir).await?;

        let name = format!("canopy-{}", scope_dir_name(scope));
        let args = create_args(&name, image, &work_dir, resources);

        let output = tokio::process::Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::StartFailed(format!(
                "failed to create container: {}",
                stderr.trim()
            )));
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let start = tokio::process::Command::new("docker")
            .args(["start", &name])
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        if !start.status.success() {
            let stderr = String::from_utf8_lossy(&start.stderr);
            return Err(RuntimeError::StartFailed(format!(
                "failed to start container: {}",
                stderr.trim()
            )));
        }

        Ok(ContainerHandle {
            id,
            name,
            image: image.to_string(),
        })
    }

    async fn remove_container(&self, handle: &ContainerHandle) {
        let result = tokio::process::Command::new("docker")
            .args(["rm", "-f", &handle.name])
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                debug!(container = %handle.name, id = %handle.id, "removed scope container")
            }
            Ok(output) => warn!(
                container = %handle.name,
                error = %String::from_utf8_lossy(&output.stderr).trim(),
                "failed to remove scope container"
            ),
            Err(e) => warn!(container = %handle.name, error = %e, "failed to remove scope container"),
        }
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Arguments for `docker create` of a scope container
fn create_args(
    name: &str,
    image: &str,
    work_dir: &std::path::Path,
    resources: &Resources,
) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        name.to_string(),
        "-w".to_string(),
        "/workspace".to_string(),
        "-v".to_string(),
        format!("{}:/workspace", work_dir.display()),
    ];

    if let Some(cpu) = resources.cpu {
        args.push("--cpus".to_string());
        args.push(cpu.to_string());
    }
    if let Some(mem) = resources.mem {
        args.push("--memory".to_string());
        args.push(format!("{}m", (mem * 1024.0).round() as u64));
    }
    if resources.requires_docker.unwrap_or(false) {
        args.push("-v".to_string());
        args.push("/var/run/docker.sock:/var/run/docker.sock".to_string());
    }

    args.push(image.to_string());

    // Keep container running with tail
    args.push("tail".to_string());
    args.push("-f".to_string());
    args.push("/dev/null".to_string());
    args
}

/// Arguments for `docker exec` of one leaf
fn exec_args(container: &str, task: &LeafTask, script: &str) -> Vec<String> {
    let mut args = vec!["exec".to_string(), "-w".to_string(), "/workspace".to_string()];
    for (key, value) in &task.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(container.to_string());
    args.push("sh".to_string());
    args.push("-c".to_string());
    args.push(script.to_string());
    args
}

#[async_trait::async_trait]
impl Runtime for DockerRuntime {
    async fn start(&self, scope: &ScopeId, task: LeafTask) -> Result<RuntimeHandle, RuntimeError> {
        let script = match &task.command {
            Command::Shell(script) => script.clone(),
            Command::Callable { func, .. } => {
                // callables run on the host; only shell commands enter the container
                let func = func.clone();
                let ctx = task.context(scope);
                let handle = tokio::task::spawn_blocking(move || run_callable(&func, &ctx));
                return Ok(self.tasks.insert(scope, handle, None));
            }
        };

        if which::which("docker").is_err() {
            return Err(RuntimeError::Unavailable(
                "docker executable not found on PATH".to_string(),
            ));
        }

        let container = self.ensure_container(scope, &task).await?;
        let mut child = tokio::process::Command::new("docker")
            .args(exec_args(&container.name, &task, &script))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))?;

        let path = task.path.clone();
        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let stderr = child.stderr.take();
            let stderr_handle = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut stderr) = stderr {
                    use tokio::io::AsyncReadExt;
                    let _ = stderr.read_to_string(&mut buf).await;
                }
                buf
            });

            tokio::select! {
                status = child.wait() => {
                    let stderr = stderr_handle.await.unwrap_or_default();
                    match status {
                        Ok(status) if status.success() => LeafExit::success(),
                        Ok(status) => LeafExit {
                            code: status.code().unwrap_or(-1),
                            message: stderr.lines().rev().find(|l| !l.trim().is_empty()).map(str::to_string),
                        },
                        Err(e) => LeafExit::failure(-1, format!("failed to execute in container: {}", e)),
                    }
                }
                Ok(()) = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(path = %path, error = %e, "failed to stop docker exec");
                    }
                    LeafExit::failure(-1, "killed")
                }
            }
        });

        Ok(self.tasks.insert(scope, handle, Some(kill_tx)))
    }

    async fn poll(&self, handle: &RuntimeHandle) -> Result<LeafStatus, RuntimeError> {
        self.tasks.poll(handle).await
    }

    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), RuntimeError> {
        self.tasks.kill(handle)?;
        Ok(())
    }

    fn workspace(&self, scope: &ScopeId) -> Option<PathBuf> {
        Some(self.scope_dir(scope))
    }

    async fn shutdown(&self) -> Result<(), RuntimeError> {
        let containers: Vec<ContainerHandle> = {
            let mut containers = self.containers.lock().await;
            containers.drain().map(|(_, handle)| handle).collect()
        };
        if self.config.auto_remove {
            for handle in &containers {
                self.remove_container(handle).await;
            }
        }
        Ok(())
    }
}
