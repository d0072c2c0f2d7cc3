// Engine Configuration
// Per-run settings for the scheduler

use std::time::Duration;

/// Configuration for a run
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifier of the run; also prefixes every scope id
    pub run_id: String,
    /// How often in-flight leaves are polled on the runtime
    pub poll_interval: Duration,
    /// Whether kill requests are forwarded to the runtime
    pub forward_kills: bool,
    /// Prefix of the injected `<PREFIX>_RUN_ID`, `_NODE_PATH` and `_SCOPE_ID` variables
    pub env_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_id: generate_run_id(),
            poll_interval: Duration::from_millis(50),
            forward_kills: true,
            env_prefix: "CANOPY".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub(crate) fn env_var(&self, name: &str) -> String {
        if self.env_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.env_prefix, name)
        }
    }
}

/// Generate a short run identifier (8 hex chars)
pub fn generate_run_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let nanos = duration.as_nanos();
    format!("run-{:08x}", (nanos as u32) ^ std::process::id())
}
