//! Lifecycle statuses for jobs, graph nodes, agents and local tasks.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Created,
    Queued,
    Running,
    Cancelling,
    Cancelled,
    Timeout,
    Failure,
    Success,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::Created,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Cancelling,
        JobStatus::Cancelled,
        JobStatus::Timeout,
        JobStatus::Failure,
        JobStatus::Success,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Timeout | JobStatus::Failure | JobStatus::Success
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
            JobStatus::Failure => "failure",
            JobStatus::Success => "success",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of a single graph node within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
    /// Condition evaluated to false, or the enclosing stage was skipped.
    Skipped,
    /// Never ran because an upstream node did not succeed.
    Aborted,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }

    /// Whether downstream nodes may start after this one.
    pub fn is_success(&self) -> bool {
        matches!(self, NodeStatus::Success | NodeStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failure => "failure",
            NodeStatus::Timeout => "timeout",
            NodeStatus::Cancelled => "cancelled",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            AgentStatus::Idle => 0,
            AgentStatus::Busy => 1,
            AgentStatus::Offline => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AgentStatus::Idle),
            1 => Some(AgentStatus::Busy),
            2 => Some(AgentStatus::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Idle => f.write_str("idle"),
            AgentStatus::Busy => f.write_str("busy"),
            AgentStatus::Offline => f.write_str("offline"),
        }
    }
}

/// Outcome of a local task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
    Exception,
}

impl TaskStatus {
    pub fn node_status(self) -> NodeStatus {
        match self {
            TaskStatus::Success => NodeStatus::Success,
            TaskStatus::Failure | TaskStatus::Exception => NodeStatus::Failure,
            TaskStatus::Timeout => NodeStatus::Timeout,
            TaskStatus::Cancelled => NodeStatus::Cancelled,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Exception => "exception",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_status_u8_roundtrip() {
        for status in [AgentStatus::Idle, AgentStatus::Busy, AgentStatus::Offline] {
            assert_eq!(AgentStatus::from_u8(status.as_u8()), Some(status));
        }
        assert_eq!(AgentStatus::from_u8(9), None);
    }

    #[test]
    fn test_node_status_success_rules() {
        assert!(NodeStatus::Skipped.is_success());
        assert!(!NodeStatus::Aborted.is_success());
        assert!(NodeStatus::Aborted.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
    }

    #[test]
    fn test_job_status_serde() {
        let json = serde_json::to_string(&JobStatus::Cancelling).unwrap();
        assert_eq!(json, "\"cancelling\"");
    }
}
