//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and
//! the adapters around it: cloud providers, persistence, the agent wire
//! protocol and the condition script engine.

use crate::agent::{Instance, Zone};
use crate::events::Event;
use crate::ids::{AgentId, JobId};
use crate::job::{Job, NodeRecord};
use crate::node::NodePath;
use crate::pipeline::DockerOption;
use crate::task::{LocalTask, TaskResult};
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use tokio::sync::watch;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Flips to `true` once the work it was handed to should stop.
pub type CancelSignal = watch::Receiver<bool>;

/// Event bus for publishing and subscribing to lifecycle events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event. Having no subscribers is not an error.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events whose subject matches a pattern.
    /// Pattern supports wildcards: `job.*.finished`, `agent.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Persistence for job snapshots.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn save_job(&self, job: &Job) -> Result<()>;

    async fn save_node(&self, record: &NodeRecord) -> Result<()>;
}

/// Cloud provider that starts and deletes the instances backing agents.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Start an instance and return once it is running.
    async fn start_instance(&self, zone: &Zone, name: &str) -> Result<Instance>;

    async fn delete_instance(&self, instance: &Instance) -> Result<()>;

    /// Instances the provider currently knows about in a zone.
    async fn list_instances(&self, zone: &str) -> Result<Vec<Instance>>;
}

/// Script engine for node conditions.
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    /// Syntax check performed before a job starts.
    fn validate(&self, _script: &str) -> Result<()> {
        Ok(())
    }

    async fn evaluate(&self, script: &str, variables: &BTreeMap<String, String>) -> Result<bool>;
}

/// Work item sent to a remote agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDispatch {
    pub job_id: JobId,
    pub node: NodePath,
    pub agent_id: AgentId,
    pub script: Option<String>,
    pub plugin: Option<String>,
    pub docker: Option<DockerOption>,
    pub variables: BTreeMap<String, String>,
    pub timeout_secs: Option<u64>,
}

/// Wire protocol to physical agents.
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    async fn dispatch(&self, step: StepDispatch) -> Result<()>;

    async fn kill(&self, agent_id: AgentId, job_id: JobId, node: &NodePath) -> Result<()>;
}

/// Executor for steps that run on the server rather than on an agent.
#[async_trait]
pub trait LocalTaskRunner: Send + Sync {
    async fn run(&self, task: LocalTask, cancel: CancelSignal) -> Result<TaskResult>;
}
