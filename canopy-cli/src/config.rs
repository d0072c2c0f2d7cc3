// CLI Configuration
// Optional config.yaml holding defaults for `canopy run`

use clap::ValueEnum;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which runtime executes leaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Host processes, one working directory per scope
    #[default]
    Local,
    /// One docker container per scope
    Docker,
}

/// Contents of `config.yaml`.
///
/// ```yaml
/// runtime: docker
/// work_dir: /var/tmp/canopy
/// poll_interval_ms: 100
/// default_image: python:3.12-slim
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub runtime: RuntimeKind,
    /// Parent of the per-scope working directories
    pub work_dir: Option<PathBuf>,
    /// Root of the filesystem data store; in-memory when unset
    pub data_dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
    /// Docker image for leaves without an image reference
    pub default_image: Option<String>,
    /// Leave scope containers behind after the run
    pub keep_containers: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Local,
            work_dir: None,
            data_dir: None,
            poll_interval_ms: 50,
            default_image: None,
            keep_containers: false,
        }
    }
}

impl CliConfig {
    /// `<config dir>/canopy/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("canopy").join("config.yaml"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .wrap_err_with(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load an explicitly named file, else the default file if it exists
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: CliConfig = serde_yaml::from_str("runtime: docker\n").unwrap();
        assert_eq!(config.runtime, RuntimeKind::Docker);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert!(config.work_dir.is_none());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(serde_yaml::from_str::<CliConfig>("runtimes: local\n").is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "work_dir: /tmp/canopy-work\npoll_interval_ms: 0\nkeep_containers: true\n",
        )
        .unwrap();

        let config = CliConfig::resolve(Some(&path)).unwrap();
        assert_eq!(config.work_dir, Some(PathBuf::from("/tmp/canopy-work")));
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert!(config.keep_containers);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CliConfig::resolve(Some(&dir.path().join("nope.yaml"))).unwrap_err();
        assert!(err.to_string().contains("nope.yaml"));
    }
}
