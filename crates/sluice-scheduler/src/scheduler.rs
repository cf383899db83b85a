//! Job scheduler.
//!
//! Owns the running jobs. Each job is walked in topological order: gates
//! (flow and stages) complete as soon as they are reached, steps either run
//! on the local task runner or reserve an agent and are dispatched to it.
//! Steps that find no idle agent wait in the [`QueueManager`] until one is
//! released or registered.
//!
//! All changes to a job happen under that job's lock. Local task results
//! and lost agents reported by the pool come back over channels consumed by
//! [`JobScheduler::spawn`], together with agent events from the bus.

use crate::agents::AgentRegistry;
use crate::config::SchedulerConfig;
use crate::dag::ExecutionGraph;
use crate::lifecycle::JobLifecycle;
use crate::queue::QueueManager;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use petgraph::graph::NodeIndex;
use sluice_core::agent::{AgentRequirement, Assignment};
use sluice_core::events::*;
use sluice_core::ids::{AgentId, JobId};
use sluice_core::job::{Job, NodeRecord};
use sluice_core::node::NodePath;
use sluice_core::ports::{
    ConditionEvaluator, EventBus, JobRepository, LocalTaskRunner, StepDispatch, StepDispatcher,
};
use sluice_core::status::{AgentStatus, JobStatus, NodeStatus};
use sluice_core::task::{DEFAULT_TASK_TIMEOUT_SECS, EXIT_CODE_SENTINEL, LocalTask, TaskResult};
use sluice_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a finished step reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub exit_code: Option<i64>,
    /// Variables exported to the steps that run after this one.
    pub outputs: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl NodeOutcome {
    pub fn success() -> Self {
        Self {
            status: NodeStatus::Success,
            exit_code: Some(0),
            outputs: BTreeMap::new(),
            error: None,
        }
    }

    pub fn failure(exit_code: i64, error: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Failure,
            exit_code: Some(exit_code),
            outputs: BTreeMap::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn from_task(result: &TaskResult) -> Self {
        Self {
            status: result.status.node_status(),
            exit_code: Some(result.exit_code),
            outputs: BTreeMap::new(),
            error: result.error.clone(),
        }
    }
}

/// Adapters the scheduler talks to.
#[derive(Clone)]
pub struct SchedulerPorts {
    pub bus: Arc<dyn EventBus>,
    pub repository: Arc<dyn JobRepository>,
    pub dispatcher: Arc<dyn StepDispatcher>,
    pub local: Arc<dyn LocalTaskRunner>,
    pub conditions: Arc<dyn ConditionEvaluator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    FailFast,
    Cancelled,
}

impl Halt {
    /// Status given to steps that never started.
    fn pending_status(self) -> NodeStatus {
        match self {
            Halt::FailFast => NodeStatus::Aborted,
            Halt::Cancelled => NodeStatus::Cancelled,
        }
    }
}

enum Readiness {
    Waiting,
    Ready,
    Skip,
    Abort,
}

struct Completion {
    job_id: JobId,
    path: NodePath,
    outcome: NodeOutcome,
}

struct JobRun {
    job: Job,
    graph: Arc<ExecutionGraph>,
    /// One record per graph vertex, indexed like the graph.
    nodes: Vec<NodeRecord>,
    /// Job variables plus outputs of finished steps.
    variables: BTreeMap<String, String>,
    cancel: watch::Sender<bool>,
    halt: Option<Halt>,
}

impl JobRun {
    fn status(&self, idx: NodeIndex) -> NodeStatus {
        self.nodes[idx.index()].status
    }

    fn agent(&self, idx: NodeIndex) -> Option<AgentId> {
        self.nodes[idx.index()].agent_id
    }

    fn running(&self) -> Vec<NodeIndex> {
        self.graph
            .indices()
            .filter(|&idx| self.status(idx) == NodeStatus::Running)
            .collect()
    }

    fn at_capacity(&self) -> bool {
        self.job
            .max_parallel
            .is_some_and(|max| self.running().len() >= max)
    }

    /// Failed in a way that fails the job.
    fn is_blocking_failure(&self, idx: NodeIndex) -> bool {
        match self.status(idx) {
            NodeStatus::Failure | NodeStatus::Timeout => !self.graph[idx].node.allow_failure,
            NodeStatus::Aborted | NodeStatus::Cancelled => true,
            _ => false,
        }
    }

    fn readiness(&self, idx: NodeIndex) -> Readiness {
        let mut abort = false;
        for parent in self.graph.parents(idx) {
            match self.status(parent) {
                NodeStatus::Pending | NodeStatus::Running => return Readiness::Waiting,
                _ if self.is_blocking_failure(parent) => abort = true,
                _ => {}
            }
        }
        if abort {
            return Readiness::Abort;
        }
        match self.graph.container_of(idx) {
            Some(container) if self.status(container) == NodeStatus::Skipped => Readiness::Skip,
            _ => Readiness::Ready,
        }
    }

    /// Definition variables overlaid with runtime ones.
    fn variables_for(&self, idx: NodeIndex) -> BTreeMap<String, String> {
        let mut vars = self.graph[idx].variables.clone();
        vars.extend(self.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}

type LostAgent = (AgentId, Assignment);

struct Inbox {
    completions: mpsc::UnboundedReceiver<Completion>,
    lost: mpsc::UnboundedReceiver<LostAgent>,
}

pub struct JobScheduler {
    registry: Arc<AgentRegistry>,
    lifecycle: JobLifecycle,
    ports: SchedulerPorts,
    /// Zone for jobs and nodes that name none.
    default_zone: String,
    jobs: DashMap<JobId, Arc<Mutex<JobRun>>>,
    queue: std::sync::Mutex<QueueManager>,
    completions: mpsc::UnboundedSender<Completion>,
    lost: mpsc::UnboundedSender<LostAgent>,
    inbox: std::sync::Mutex<Option<Inbox>>,
}

impl JobScheduler {
    pub fn new(registry: Arc<AgentRegistry>, ports: SchedulerPorts) -> Result<Arc<Self>> {
        Self::with_config(registry, ports, &SchedulerConfig::default())
    }

    pub fn with_config(
        registry: Arc<AgentRegistry>,
        ports: SchedulerPorts,
        config: &SchedulerConfig,
    ) -> Result<Arc<Self>> {
        let lifecycle = JobLifecycle::new(ports.repository.clone(), ports.bus.clone())?;
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let (lost, lost_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            registry,
            lifecycle,
            ports,
            default_zone: config.default_zone.clone(),
            jobs: DashMap::new(),
            queue: std::sync::Mutex::new(QueueManager::new()),
            completions,
            lost,
            inbox: std::sync::Mutex::new(Some(Inbox {
                completions: completions_rx,
                lost: lost_rx,
            })),
        }))
    }

    /// Channel for agents that went away while running a step, for
    /// [`crate::PoolManager::with_lost_agents`]. Read by the loop started
    /// with [`JobScheduler::spawn`].
    pub fn lost_agents(&self) -> mpsc::UnboundedSender<(AgentId, Assignment)> {
        self.lost.clone()
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &JobLifecycle {
        &self.lifecycle
    }

    /// Snapshot of a job.
    pub async fn job(&self, job_id: JobId) -> Option<Job> {
        let entry = self.entry(job_id).ok()?;
        let run = entry.lock().await;
        Some(run.job.clone())
    }

    pub async fn node_status(&self, job_id: JobId, path: &NodePath) -> Option<NodeStatus> {
        let entry = self.entry(job_id).ok()?;
        let run = entry.lock().await;
        let idx = run.graph.find(path)?;
        Some(run.status(idx))
    }

    pub async fn node_records(&self, job_id: JobId) -> Option<Vec<NodeRecord>> {
        let entry = self.entry(job_id).ok()?;
        let run = entry.lock().await;
        Some(run.nodes.clone())
    }

    /// Number of steps waiting for an agent.
    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    /// Drop a finished job from memory.
    pub async fn forget(&self, job_id: JobId) -> Option<Job> {
        let entry = self.entry(job_id).ok()?;
        let job = {
            let run = entry.lock().await;
            if !run.job.is_finished() {
                return None;
            }
            run.job.clone()
        };
        self.jobs.remove(&job_id);
        Some(job)
    }

    /// Start a job on a compiled graph.
    ///
    /// Condition scripts are checked before anything runs; a bad script
    /// fails the job straight away.
    ///
    /// Settings the pipeline declares apply on top of the job's own: a
    /// fail-fast pipeline always fails fast, and its timeout and parallelism
    /// limit fill in whatever the job leaves unset.
    pub async fn submit(self: &Arc<Self>, mut job: Job, graph: Arc<ExecutionGraph>) -> Result<JobId> {
        let job_id = job.id;
        let definition = graph.definition();
        job.fail_fast |= definition.fail_fast;
        job.timeout_secs = job.timeout_secs.or(definition.timeout_secs);
        job.max_parallel = job.max_parallel.or(definition.max_parallel);
        if job.zone.is_empty() {
            job.zone = self.default_zone.clone();
        }

        let nodes = graph
            .indices()
            .map(|idx| NodeRecord::new(job_id, graph[idx].path().clone()))
            .collect();
        let (cancel, _) = watch::channel(false);
        let entry = Arc::new(Mutex::new(JobRun {
            variables: job.variables.clone(),
            job,
            graph: graph.clone(),
            nodes,
            cancel,
            halt: None,
        }));
        // Locked before it becomes visible, so no tick sees a job that has
        // not started yet.
        let mut run = entry.clone().lock_owned().await;
        match self.jobs.entry(job_id) {
            Entry::Occupied(_) => {
                return Err(Error::InvalidInput(format!("job {job_id} already submitted")));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        self.lifecycle
            .transition(&mut run.job, JobStatus::Created, None)
            .await?;

        for script in graph.conditions() {
            if let Err(e) = self.ports.conditions.validate(script) {
                let message = format!("invalid condition '{script}': {e}");
                self.lifecycle
                    .transition(&mut run.job, JobStatus::Failure, Some(Error::Condition(message.clone())))
                    .await?;
                return Err(Error::Condition(message));
            }
        }

        self.lifecycle
            .transition(&mut run.job, JobStatus::Queued, None)
            .await?;
        self.lifecycle
            .transition(&mut run.job, JobStatus::Running, None)
            .await?;
        info!(job_id = %job_id, pipeline = %run.job.pipeline, nodes = graph.len(), "Job started");

        if let Some(secs) = run.job.timeout_secs {
            self.spawn_watchdog(job_id, Duration::from_secs(secs));
        }

        self.advance(&mut run).await?;
        Ok(job_id)
    }

    /// Re-walk a job's graph and start whatever became runnable.
    pub async fn tick(self: &Arc<Self>, job_id: JobId) -> Result<()> {
        let entry = self.entry(job_id)?;
        let mut run = entry.lock().await;
        self.advance(&mut run).await
    }

    /// Record the result of a running step and move the job forward.
    pub async fn on_node_finished(
        self: &Arc<Self>,
        job_id: JobId,
        path: &NodePath,
        outcome: NodeOutcome,
    ) -> Result<()> {
        let entry = self.entry(job_id)?;
        let released = {
            let mut run = entry.lock().await;
            let idx = run
                .graph
                .find(path)
                .ok_or_else(|| Error::NodeNotFound(path.to_string()))?;
            if run.status(idx) != NodeStatus::Running {
                debug!(job_id = %job_id, node = %path, "Ignoring result for a step that is not running");
                return Ok(());
            }

            let agent = run.agent(idx);
            if let Some(agent_id) = agent
                && let Err(e) = self.registry.release(agent_id).await
            {
                warn!(agent_id = %agent_id, error = %e, "Failed to release agent");
            }

            run.variables.extend(outcome.outputs.clone());
            self.complete(&mut run, idx, outcome).await;
            self.after_failure(&mut run, idx).await;
            self.advance(&mut run).await?;
            agent.is_some()
        };

        if released {
            self.drain_queue().await;
        }
        Ok(())
    }

    /// Stop a job. Steps in flight are signalled and the job passes through
    /// `Cancelling` until they report back.
    pub async fn cancel(self: &Arc<Self>, job_id: JobId, reason: impl Into<String>) -> Result<()> {
        let entry = self.entry(job_id)?;
        let mut run = entry.lock().await;
        if run.job.is_finished() || run.halt == Some(Halt::Cancelled) {
            return Ok(());
        }

        let reason = reason.into();
        info!(job_id = %job_id, reason = %reason, "Cancelling job");
        run.job.error = Some(reason);
        self.halt(&mut run, Halt::Cancelled).await;

        if !run.running().is_empty() && run.job.status == JobStatus::Running {
            self.lifecycle
                .transition(&mut run.job, JobStatus::Cancelling, None)
                .await?;
        }
        self.try_finish(&mut run).await
    }

    /// An agent went away while running one of this job's steps. The step
    /// fails and the job fails with it.
    pub async fn on_agent_lost(
        self: &Arc<Self>,
        agent_id: AgentId,
        job_id: JobId,
        path: &NodePath,
    ) -> Result<()> {
        let entry = self.entry(job_id)?;
        let mut run = entry.lock().await;
        if run.job.is_finished() {
            return Ok(());
        }
        let idx = run
            .graph
            .find(path)
            .ok_or_else(|| Error::NodeNotFound(path.to_string()))?;
        if run.status(idx) != NodeStatus::Running || run.agent(idx) != Some(agent_id) {
            return Ok(());
        }

        let cause = Error::AgentLost {
            agent: agent_id.to_string(),
            job: job_id.to_string(),
        };
        warn!(job_id = %job_id, node = %path, agent_id = %agent_id, "Step lost its agent");
        self.complete(
            &mut run,
            idx,
            NodeOutcome::failure(EXIT_CODE_SENTINEL, cause.to_string()),
        )
        .await;
        self.abort(&mut run, JobStatus::Failure, NodeStatus::Cancelled, Some(cause))
            .await
    }

    /// Deadline reached: running steps time out, the job with them.
    pub async fn timeout_job(self: &Arc<Self>, job_id: JobId) -> Result<()> {
        let entry = self.entry(job_id)?;
        let mut run = entry.lock().await;
        if run.job.is_finished() {
            return Ok(());
        }
        warn!(job_id = %job_id, timeout_secs = ?run.job.timeout_secs, "Job timed out");
        if let Some(secs) = run.job.timeout_secs {
            run.job.error = Some(format!("job exceeded its timeout of {secs}s"));
        }
        self.abort(&mut run, JobStatus::Timeout, NodeStatus::Timeout, None)
            .await
    }

    /// Retry queued steps, highest priority first. Returns how many were
    /// dispatched.
    pub async fn drain_queue(self: &Arc<Self>) -> usize {
        let items = self.queue().drain();
        let mut started = 0;

        for item in items {
            let Ok(entry) = self.entry(item.job_id) else {
                continue;
            };
            let mut run = entry.lock().await;
            if run.job.status != JobStatus::Running
                || run.halt.is_some()
                || run.status(item.node) != NodeStatus::Pending
            {
                continue;
            }
            if run.at_capacity() {
                self.queue().requeue(item);
                continue;
            }

            let assignment = Assignment {
                job_id: item.job_id,
                node: item.path.clone(),
            };
            match self.registry.reserve(&item.requirement, assignment).await {
                Ok(agent) => {
                    debug!(job_id = %item.job_id, node = %item.path, agent_id = %agent.id, "Dispatching queued step");
                    self.dispatch(&mut run, item.node, agent.id).await;
                    started += 1;
                }
                Err(e) if e.is_retryable() => {
                    self.queue().requeue(item);
                    continue;
                }
                Err(e) => {
                    self.complete(
                        &mut run,
                        item.node,
                        NodeOutcome::failure(EXIT_CODE_SENTINEL, e.to_string()),
                    )
                    .await;
                    self.after_failure(&mut run, item.node).await;
                }
            }

            if let Err(e) = self.advance(&mut run).await {
                error!(job_id = %item.job_id, error = %e, "Failed to advance job");
            }
        }
        started
    }

    /// Check every remote step against the registry and fail the ones whose
    /// agent is gone or no longer holds the step. Used when agent events may
    /// have been missed. Returns how many steps were failed.
    pub async fn resync_agents(self: &Arc<Self>) -> usize {
        let entries: Vec<Arc<Mutex<JobRun>>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        let mut lost = Vec::new();
        for entry in entries {
            let run = entry.lock().await;
            if run.job.is_finished() {
                continue;
            }
            for idx in run.running() {
                let Some(agent_id) = run.agent(idx) else {
                    continue;
                };
                let path = run.graph[idx].path().clone();
                let holds_step = self.registry.get(agent_id).is_some_and(|slot| {
                    slot.status() == AgentStatus::Busy
                        && slot
                            .assignment()
                            .is_some_and(|a| a.job_id == run.job.id && a.node == path)
                });
                if !holds_step {
                    lost.push((agent_id, run.job.id, path));
                }
            }
        }

        let count = lost.len();
        for (agent_id, job_id, path) in lost {
            if let Err(e) = self.on_agent_lost(agent_id, job_id, &path).await {
                warn!(agent_id = %agent_id, job_id = %job_id, error = %e, "Failed to handle lost agent");
            }
        }
        count
    }

    /// Consume local task results, lost agents and agent events until
    /// shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(Inbox {
                mut completions,
                mut lost,
            }) = self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take()
            else {
                warn!("Scheduler event loop already running");
                return;
            };
            let mut events = match self.ports.bus.subscribe("agent.>").await {
                Ok(events) => events,
                Err(e) => {
                    error!(error = %e, "Failed to subscribe to agent events");
                    return;
                }
            };

            info!("Scheduler started");
            loop {
                tokio::select! {
                    Some(done) = completions.recv() => {
                        if let Err(e) = self.on_node_finished(done.job_id, &done.path, done.outcome).await {
                            warn!(job_id = %done.job_id, node = %done.path, error = %e, "Failed to record step result");
                        }
                    }
                    Some((agent_id, assignment)) = lost.recv() => {
                        if let Err(e) = self.on_agent_lost(agent_id, assignment.job_id, &assignment.node).await {
                            warn!(agent_id = %agent_id, error = %e, "Failed to handle lost agent");
                        }
                    }
                    Some(event) = events.next() => match event {
                        Ok(Event::AgentLost(p)) => {
                            if let (Some(job_id), Some(node)) = (p.job_id, p.node)
                                && let Err(e) = self.on_agent_lost(p.agent_id, job_id, &node).await
                            {
                                warn!(agent_id = %p.agent_id, error = %e, "Failed to handle lost agent");
                            }
                        }
                        Ok(Event::AgentRegistered(_)) => {
                            self.drain_queue().await;
                        }
                        Ok(Event::AgentStatusChanged(p)) if p.to == AgentStatus::Idle => {
                            self.drain_queue().await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Agent events missed, checking running steps");
                            let failed = self.resync_agents().await;
                            if failed > 0 {
                                info!(failed, "Failed steps whose agents are gone");
                            }
                            self.drain_queue().await;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Scheduler stopped");
        })
    }

    fn entry(&self, job_id: JobId) -> Result<Arc<Mutex<JobRun>>> {
        self.jobs
            .get(&job_id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    fn queue(&self) -> MutexGuard<'_, QueueManager> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_watchdog(self: &Arc<Self>, job_id: JobId, timeout: Duration) {
        let scheduler: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(scheduler) = scheduler.upgrade()
                && let Err(e) = scheduler.timeout_job(job_id).await
            {
                warn!(job_id = %job_id, error = %e, "Failed to time out job");
            }
        });
    }

    /// One pass over the graph in topological order, then finish the job if
    /// nothing is left to run.
    async fn advance(self: &Arc<Self>, run: &mut JobRun) -> Result<()> {
        if run.job.is_finished() {
            return Ok(());
        }

        let graph = run.graph.clone();
        for &idx in graph.topological_order() {
            if run.halt.is_some() {
                break;
            }
            if run.status(idx) != NodeStatus::Pending || self.queue().contains(run.job.id, idx) {
                continue;
            }

            match run.readiness(idx) {
                Readiness::Waiting => continue,
                Readiness::Skip => {
                    self.mark(run, idx, NodeStatus::Skipped).await;
                    continue;
                }
                Readiness::Abort => {
                    self.mark(run, idx, NodeStatus::Aborted).await;
                    continue;
                }
                Readiness::Ready => {}
            }

            let node = &graph[idx];
            if node.is_step() && run.at_capacity() {
                continue;
            }

            if let Some(script) = node.node.condition.as_deref() {
                let vars = run.variables_for(idx);
                match self.ports.conditions.evaluate(script, &vars).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(job_id = %run.job.id, node = %node.path(), "Condition false, skipping");
                        self.mark(run, idx, NodeStatus::Skipped).await;
                        continue;
                    }
                    Err(e) => {
                        let outcome = NodeOutcome::failure(EXIT_CODE_SENTINEL, e.to_string());
                        self.complete(run, idx, outcome).await;
                        self.after_failure(run, idx).await;
                        continue;
                    }
                }
            }

            if !node.is_step() {
                self.mark(run, idx, NodeStatus::Success).await;
            } else if node.node.local {
                self.start_local(run, idx).await;
            } else {
                self.start_remote(run, idx).await;
            }
        }

        self.try_finish(run).await
    }

    async fn start_local(&self, run: &mut JobRun, idx: NodeIndex) {
        let node = &run.graph[idx];
        let mut task = LocalTask::new(node.path().to_string())
            .with_job(run.job.id)
            .with_timeout(node.node.timeout_secs.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS));
        task.script = node.node.run.clone();
        task.plugin = node.node.plugin.clone();
        task.inputs = run.variables_for(idx);
        if let Some(docker) = &node.docker {
            task = task.with_image(docker.image.clone());
        }
        let path = node.path().clone();

        self.mark(run, idx, NodeStatus::Running).await;

        let runner = self.ports.local.clone();
        let completions = self.completions.clone();
        let cancel = run.cancel.subscribe();
        let job_id = run.job.id;
        tokio::spawn(async move {
            let outcome = match runner.run(task, cancel).await {
                Ok(result) => NodeOutcome::from_task(&result),
                Err(e) => NodeOutcome::failure(EXIT_CODE_SENTINEL, e.to_string()),
            };
            if completions
                .send(Completion {
                    job_id,
                    path: path.clone(),
                    outcome,
                })
                .is_err()
            {
                warn!(job_id = %job_id, node = %path, "Scheduler gone, dropping local task result");
            }
        });
    }

    async fn start_remote(&self, run: &mut JobRun, idx: NodeIndex) {
        let node = &run.graph[idx];
        let path = node.path().clone();
        let mut requirement =
            AgentRequirement::new(node.agent.zone.clone().unwrap_or_else(|| run.job.zone.clone()));
        requirement.tags = node.agent.tags.iter().cloned().collect();
        requirement.docker_image = node.docker.as_ref().map(|d| d.image.clone());

        let assignment = Assignment {
            job_id: run.job.id,
            node: path.clone(),
        };
        match self.registry.reserve(&requirement, assignment).await {
            Ok(agent) => self.dispatch(run, idx, agent.id).await,
            Err(e) if e.is_retryable() => {
                debug!(job_id = %run.job.id, node = %path, zone = %requirement.zone, "No agent available, queueing step");
                self.queue()
                    .enqueue(run.job.id, idx, path, requirement, run.job.priority);
            }
            Err(e) => {
                self.complete(run, idx, NodeOutcome::failure(EXIT_CODE_SENTINEL, e.to_string()))
                    .await;
                self.after_failure(run, idx).await;
            }
        }
    }

    /// Hand a step to its reserved agent.
    async fn dispatch(&self, run: &mut JobRun, idx: NodeIndex, agent_id: AgentId) {
        run.nodes[idx.index()].agent_id = Some(agent_id);
        self.mark(run, idx, NodeStatus::Running).await;

        let node = &run.graph[idx];
        let step = StepDispatch {
            job_id: run.job.id,
            node: node.path().clone(),
            agent_id,
            script: node.node.run.clone(),
            plugin: node.node.plugin.clone(),
            docker: node.docker.clone(),
            variables: run.variables_for(idx),
            timeout_secs: node.node.timeout_secs,
        };

        if let Err(e) = self.ports.dispatcher.dispatch(step).await {
            warn!(job_id = %run.job.id, agent_id = %agent_id, error = %e, "Dispatch failed");
            if let Err(e) = self.registry.release(agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to release agent");
            }
            self.complete(run, idx, NodeOutcome::failure(EXIT_CODE_SENTINEL, e.to_string()))
                .await;
            self.after_failure(run, idx).await;
        }
    }

    /// Apply fail-fast after a step ended badly.
    async fn after_failure(&self, run: &mut JobRun, idx: NodeIndex) {
        if run.is_blocking_failure(idx) && run.job.fail_fast && run.halt.is_none() {
            info!(job_id = %run.job.id, node = %run.graph[idx].path(), "Step failed, stopping job");
            self.halt(run, Halt::FailFast).await;
        }
    }

    /// Stop starting steps and signal the ones in flight.
    async fn halt(&self, run: &mut JobRun, reason: Halt) {
        run.halt = Some(reason);
        self.queue().remove_job(run.job.id);
        run.cancel.send_replace(true);

        for idx in run.running() {
            if let Some(agent_id) = run.agent(idx)
                && let Err(e) = self
                    .ports
                    .dispatcher
                    .kill(agent_id, run.job.id, run.graph[idx].path())
                    .await
            {
                warn!(agent_id = %agent_id, job_id = %run.job.id, error = %e, "Failed to kill step");
            }
        }
    }

    /// End the job now, without waiting for steps in flight.
    async fn abort(
        &self,
        run: &mut JobRun,
        status: JobStatus,
        running_status: NodeStatus,
        cause: Option<Error>,
    ) -> Result<()> {
        self.halt(run, Halt::Cancelled).await;

        for idx in run.running() {
            if let Some(agent_id) = run.agent(idx)
                && let Err(e) = self.registry.release(agent_id).await
            {
                warn!(agent_id = %agent_id, error = %e, "Failed to release agent");
            }
            self.mark(run, idx, running_status).await;
        }
        for idx in run.graph.clone().indices() {
            if run.status(idx) == NodeStatus::Pending {
                self.mark(run, idx, NodeStatus::Aborted).await;
            }
        }

        let status = if run.job.status == JobStatus::Cancelling {
            JobStatus::Cancelled
        } else {
            status
        };
        self.lifecycle.transition(&mut run.job, status, cause).await
    }

    /// Finish the job once nothing runs and nothing is left to start.
    async fn try_finish(&self, run: &mut JobRun) -> Result<()> {
        if run.job.is_finished() || !run.running().is_empty() {
            return Ok(());
        }

        let pending: Vec<NodeIndex> = run
            .graph
            .indices()
            .filter(|&idx| run.status(idx) == NodeStatus::Pending)
            .collect();
        if !pending.is_empty() {
            let Some(halt) = run.halt else {
                // Waiting for agents
                return Ok(());
            };
            for idx in pending {
                self.mark(run, idx, halt.pending_status()).await;
            }
        }

        let status = match run.halt {
            Some(Halt::Cancelled) => JobStatus::Cancelled,
            _ => {
                let failed = run
                    .graph
                    .indices()
                    .find(|&idx| run.is_blocking_failure(idx));
                match failed {
                    Some(idx) => {
                        if run.job.error.is_none() {
                            run.job.error = Some(format!("step {} failed", run.graph[idx].path()));
                        }
                        JobStatus::Failure
                    }
                    None => JobStatus::Success,
                }
            }
        };

        self.queue().remove_job(run.job.id);
        self.lifecycle.transition(&mut run.job, status, None).await?;
        info!(job_id = %run.job.id, status = %status, "Job finished");
        Ok(())
    }

    async fn mark(&self, run: &mut JobRun, idx: NodeIndex, status: NodeStatus) {
        self.record(run, idx, |record| record.status = status).await;
    }

    async fn complete(&self, run: &mut JobRun, idx: NodeIndex, outcome: NodeOutcome) {
        self.record(run, idx, |record| {
            record.status = outcome.status;
            record.exit_code = outcome.exit_code;
            record.error = outcome.error;
        })
        .await;
    }

    /// Update a node record, persist it and publish the change.
    async fn record<F>(&self, run: &mut JobRun, idx: NodeIndex, update: F)
    where
        F: FnOnce(&mut NodeRecord),
    {
        let record = &mut run.nodes[idx.index()];
        update(record);

        let now = Utc::now();
        if record.status == NodeStatus::Running {
            record.started_at.get_or_insert(now);
        } else if record.status.is_terminal() {
            record.finished_at = Some(now);
        }

        debug!(job_id = %record.job_id, node = %record.path, status = %record.status, "Node status changed");
        if let Err(e) = self.ports.repository.save_node(record).await {
            warn!(job_id = %record.job_id, node = %record.path, error = %e, "Failed to save node record");
        }

        let event = Event::NodeStatusChanged(NodeStatusChangedPayload {
            job_id: record.job_id,
            path: record.path.clone(),
            status: record.status,
            agent_id: record.agent_id,
            exit_code: record.exit_code,
            error: record.error.clone(),
            timestamp: now,
        });
        if let Err(e) = self.ports.bus.publish(event).await {
            warn!(error = %e, "Failed to publish node status event");
        }
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("jobs", &self.jobs.len())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}
