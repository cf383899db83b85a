//! Output and configuration types shared by the executor.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Output line captured from a task container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Join captured lines of one stream.
pub fn collect_stream(lines: &[OutputLine], stream: OutputStream) -> String {
    lines
        .iter()
        .filter(|l| l.stream == stream)
        .map(|l| l.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Configuration for local task execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Image used when neither the task nor its plugin names one.
    pub default_image: String,
    /// Command prefix the script is appended to.
    pub shell: Vec<String>,
    /// How long a kill may take before the executor gives up on it.
    pub kill_grace_secs: u64,
    /// Upper bound on captured output, per stream.
    pub max_output_bytes: usize,
    pub server_url: String,
    pub workspace: String,
    pub plugin_dir: String,
    /// Prefix of container names; also the value of the task label.
    pub container_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_image: "alpine:3".to_string(),
            shell: vec!["sh".to_string(), "-c".to_string()],
            kill_grace_secs: 10,
            max_output_bytes: 64 * 1024,
            server_url: "http://localhost:8080".to_string(),
            workspace: "/ws/".to_string(),
            plugin_dir: "/ws/.plugins".to_string(),
            container_prefix: "sluice-task".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Environment every task container starts with. Task inputs are
    /// applied on top.
    pub fn default_env(&self) -> Vec<(String, String)> {
        vec![
            ("SLUICE_SERVER_URL".to_string(), self.server_url.clone()),
            ("SLUICE_WORKSPACE".to_string(), self.workspace.clone()),
            ("SLUICE_PLUGIN_DIR".to_string(), self.plugin_dir.clone()),
        ]
    }
}
