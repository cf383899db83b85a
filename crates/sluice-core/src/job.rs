//! Job and per-node execution records.

use crate::ids::{AgentId, JobId};
use crate::node::NodePath;
use crate::status::{JobStatus, NodeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub pipeline: String,
    /// Zone used for nodes that do not name one.
    pub zone: String,
    pub status: JobStatus,
    /// Higher runs first when agents are scarce.
    pub priority: i32,
    pub fail_fast: bool,
    pub timeout_secs: Option<u64>,
    pub max_parallel: Option<usize>,
    pub variables: BTreeMap<String, String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(pipeline: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            pipeline: pipeline.into(),
            zone: zone.into(),
            status: JobStatus::Pending,
            priority: 0,
            fail_fast: false,
            timeout_secs: None,
            max_parallel: None,
            variables: BTreeMap::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub job_id: JobId,
    pub path: NodePath,
    pub status: NodeStatus,
    pub agent_id: Option<AgentId>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn new(job_id: JobId, path: NodePath) -> Self {
        Self {
            job_id,
            path,
            status: NodeStatus::Pending,
            agent_id: None,
            exit_code: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}
