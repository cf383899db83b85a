//! Shared fixtures for scheduler integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use sluice_core::agent::Agent;
use sluice_core::ids::{AgentId, JobId};
use sluice_core::job::{Job, NodeRecord};
use sluice_core::node::{NodePath, NodeTree};
use sluice_core::pipeline::PipelineDefinition;
use sluice_core::ports::{
    CancelSignal, ConditionEvaluator, JobRepository, LocalTaskRunner, StepDispatch, StepDispatcher,
};
use sluice_core::status::{JobStatus, TaskStatus};
use sluice_core::task::{EXIT_CODE_SENTINEL, LocalTask, TaskResult};
use sluice_core::{Error, Result};
use sluice_scheduler::{
    AgentRegistry, BroadcastEventBus, ExecutionGraph, GraphCompiler, JobScheduler, SchedulerConfig,
    SchedulerPorts,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

pub fn compile(yaml: &str) -> Arc<ExecutionGraph> {
    let definition: PipelineDefinition = serde_yaml::from_str(yaml).expect("invalid yaml");
    let tree = NodeTree::from_definition(&definition).expect("invalid pipeline");
    Arc::new(GraphCompiler::new().compile(&tree).expect("graph failed to compile"))
}

pub fn path(s: &str) -> NodePath {
    s.parse().expect("invalid node path")
}

#[derive(Default)]
pub struct MemoryRepository {
    pub jobs: Mutex<Vec<(JobId, JobStatus)>>,
    pub nodes: Mutex<Vec<NodeRecord>>,
}

impl MemoryRepository {
    pub fn job_history(&self, job_id: JobId) -> Vec<JobStatus> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl JobRepository for MemoryRepository {
    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.lock().unwrap().push((job.id, job.status));
        Ok(())
    }

    async fn save_node(&self, record: &NodeRecord) -> Result<()> {
        self.nodes.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingDispatcher {
    pub dispatched: Mutex<Vec<StepDispatch>>,
    pub killed: Mutex<Vec<(AgentId, String)>>,
}

impl RecordingDispatcher {
    pub fn paths(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.node.to_string())
            .collect()
    }

    pub fn agent_of(&self, node: &str) -> Option<AgentId> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.node.to_string() == node)
            .map(|d| d.agent_id)
    }

    pub fn killed_paths(&self) -> Vec<String> {
        self.killed.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl StepDispatcher for RecordingDispatcher {
    async fn dispatch(&self, step: StepDispatch) -> Result<()> {
        self.dispatched.lock().unwrap().push(step);
        Ok(())
    }

    async fn kill(&self, agent_id: AgentId, _job_id: JobId, node: &NodePath) -> Result<()> {
        self.killed.lock().unwrap().push((agent_id, node.to_string()));
        Ok(())
    }
}

/// Conditions of the form `true`, `false` or `$NAME == value`. Scripts
/// starting with `!!` do not parse.
pub struct SimpleConditions;

#[async_trait]
impl ConditionEvaluator for SimpleConditions {
    fn validate(&self, script: &str) -> Result<()> {
        if script.starts_with("!!") {
            return Err(Error::Condition(format!("cannot parse '{script}'")));
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str, variables: &BTreeMap<String, String>) -> Result<bool> {
        match script.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            expr => {
                let (name, value) = expr
                    .split_once("==")
                    .ok_or_else(|| Error::Condition(format!("unsupported condition '{expr}'")))?;
                let name = name.trim().trim_start_matches('$');
                Ok(variables.get(name).map(String::as_str) == Some(value.trim()))
            }
        }
    }
}

/// Local runner that exits with a per-task code, or waits for the cancel
/// signal when the task is listed in `hang`.
#[derive(Default)]
pub struct ScriptedRunner {
    pub exit_codes: Mutex<HashMap<String, i64>>,
    pub hang: Mutex<Vec<String>>,
    pub ran: Mutex<Vec<LocalTask>>,
}

impl ScriptedRunner {
    pub fn exit_with(&self, task: &str, code: i64) {
        self.exit_codes.lock().unwrap().insert(task.to_string(), code);
    }

    pub fn hang_on(&self, task: &str) {
        self.hang.lock().unwrap().push(task.to_string());
    }
}

#[async_trait]
impl LocalTaskRunner for ScriptedRunner {
    async fn run(&self, task: LocalTask, mut cancel: CancelSignal) -> Result<TaskResult> {
        self.ran.lock().unwrap().push(task.clone());
        let started_at = Utc::now();

        let hangs = self.hang.lock().unwrap().contains(&task.name);
        let (status, exit_code) = if hangs {
            while !*cancel.borrow_and_update() {
                if cancel.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            (TaskStatus::Cancelled, EXIT_CODE_SENTINEL)
        } else {
            let code = self.exit_codes.lock().unwrap().get(&task.name).copied().unwrap_or(0);
            let status = if code == 0 { TaskStatus::Success } else { TaskStatus::Failure };
            (status, code)
        };

        Ok(TaskResult {
            task_id: task.id,
            name: task.name,
            job_id: task.job_id,
            status,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            container_id: None,
            error: None,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Scheduler wired to in-memory collaborators, with its event loop running.
pub struct TestContext {
    pub bus: Arc<BroadcastEventBus>,
    pub registry: Arc<AgentRegistry>,
    pub repository: Arc<MemoryRepository>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub local: Arc<ScriptedRunner>,
    pub scheduler: Arc<JobScheduler>,
    shutdown: watch::Sender<bool>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(&SchedulerConfig {
            event_capacity: 256,
            ..Default::default()
        })
        .await
    }

    pub async fn with_config(config: &SchedulerConfig) -> Self {
        let bus = Arc::new(BroadcastEventBus::from_config(config));
        let registry = Arc::new(AgentRegistry::new(bus.clone()).unwrap());
        let repository = Arc::new(MemoryRepository::default());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let local = Arc::new(ScriptedRunner::default());

        let scheduler = JobScheduler::with_config(
            registry.clone(),
            SchedulerPorts {
                bus: bus.clone(),
                repository: repository.clone(),
                dispatcher: dispatcher.clone(),
                local: local.clone(),
                conditions: Arc::new(SimpleConditions),
            },
            config,
        )
        .unwrap();

        let (shutdown, rx) = watch::channel(false);
        scheduler.clone().spawn(rx);
        let subscribed = wait_for(Duration::from_secs(2), Duration::from_millis(5), || {
            let bus = bus.clone();
            async move { bus.subscriber_count() > 0 }
        })
        .await;
        assert!(subscribed, "scheduler never subscribed to agent events");

        Self {
            bus,
            registry,
            repository,
            dispatcher,
            local,
            scheduler,
            shutdown,
        }
    }

    pub async fn add_agent(&self, name: &str, zone: &str) -> AgentId {
        self.registry
            .register(Agent::new(name, zone))
            .await
            .unwrap()
            .id()
    }

    pub async fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.scheduler.job(job_id).await.map(|j| j.status)
    }

    pub async fn wait_for_status(&self, job_id: JobId, status: JobStatus) -> bool {
        wait_for(Duration::from_secs(5), Duration::from_millis(10), move || async move {
            self.job_status(job_id).await == Some(status)
        })
        .await
    }

    pub async fn wait_for_dispatches(&self, count: usize) -> bool {
        wait_for(Duration::from_secs(5), Duration::from_millis(10), move || async move {
            self.dispatcher.paths().len() >= count
        })
        .await
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
