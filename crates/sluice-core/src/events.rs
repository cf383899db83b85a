//! Lifecycle events published on the event bus.

use crate::ids::*;
use crate::node::NodePath;
use crate::status::{AgentStatus, JobStatus, NodeStatus, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Jobs
    JobStatusChanged(JobStatusChangedPayload),
    JobFinished(JobFinishedPayload),
    NodeStatusChanged(NodeStatusChangedPayload),

    // Agents
    AgentRegistered(AgentRegisteredPayload),
    AgentStatusChanged(AgentStatusChangedPayload),
    AgentLost(AgentLostPayload),

    // Pool
    InstanceProvisioned(InstanceProvisionedPayload),
    InstanceProvisionFailed(InstanceProvisionFailedPayload),
    InstanceDeleted(InstanceDeletedPayload),

    // Local tasks
    LocalTaskFinished(LocalTaskFinishedPayload),
}

impl Event {
    /// Dot-separated subject used for pattern subscriptions.
    pub fn subject(&self) -> String {
        match self {
            Event::JobStatusChanged(p) => format!("job.{}.status", p.job_id),
            Event::JobFinished(p) => format!("job.{}.finished", p.job_id),
            Event::NodeStatusChanged(p) => format!("job.{}.node.{}", p.job_id, p.status),
            Event::AgentRegistered(p) => format!("agent.{}.registered", p.agent_id),
            Event::AgentStatusChanged(p) => format!("agent.{}.status", p.agent_id),
            Event::AgentLost(p) => format!("agent.{}.lost", p.agent_id),
            Event::InstanceProvisioned(p) => format!("pool.{}.provisioned", p.zone),
            Event::InstanceProvisionFailed(p) => format!("pool.{}.provision_failed", p.zone),
            Event::InstanceDeleted(p) => format!("pool.{}.deleted", p.zone),
            Event::LocalTaskFinished(p) => format!("task.{}.finished", p.task_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusChangedPayload {
    pub job_id: JobId,
    pub pipeline: String,
    pub from: JobStatus,
    pub to: JobStatus,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFinishedPayload {
    pub job_id: JobId,
    pub pipeline: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusChangedPayload {
    pub job_id: JobId,
    pub path: NodePath,
    pub status: NodeStatus,
    pub agent_id: Option<AgentId>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegisteredPayload {
    pub agent_id: AgentId,
    pub name: String,
    pub zone: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusChangedPayload {
    pub agent_id: AgentId,
    pub zone: String,
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLostPayload {
    pub agent_id: AgentId,
    pub zone: String,
    pub job_id: Option<JobId>,
    pub node: Option<NodePath>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceProvisionedPayload {
    pub zone: String,
    pub instance_id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceProvisionFailedPayload {
    pub zone: String,
    pub name: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDeletedPayload {
    pub zone: String,
    pub instance_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalTaskFinishedPayload {
    pub task_id: TaskId,
    pub name: String,
    pub job_id: Option<JobId>,
    pub status: TaskStatus,
    pub exit_code: i64,
    pub timestamp: DateTime<Utc>,
}
