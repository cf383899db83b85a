//! Local tasks executed on the server's own docker daemon.

use crate::ids::{JobId, TaskId};
use crate::status::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Exit code reported when no real exit code exists (timeout, cancel, fault).
pub const EXIT_CODE_SENTINEL: i64 = -1;

pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 60;

fn default_timeout() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTask {
    #[serde(default)]
    pub id: TaskId,
    pub name: String,
    pub job_id: Option<JobId>,
    /// Passed to the container as environment variables.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub docker: Option<DockerTaskOptions>,
}

impl LocalTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            job_id: None,
            inputs: BTreeMap::new(),
            plugin: None,
            script: None,
            timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            docker: None,
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        let docker = self.docker.get_or_insert_with(DockerTaskOptions::default);
        docker.image = Some(image.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerTaskOptions {
    #[serde(default)]
    pub image: Option<String>,
    /// Host directory bind-mounted into the container as the plugin dir.
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
}

/// Immutable record of one local task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub name: String,
    pub job_id: Option<JobId>,
    pub status: TaskStatus,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub container_id: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
