//! Local task executor.
//!
//! Runs one [`LocalTask`] in a throwaway container. The container wait runs
//! on its own task while the caller races it against the task timeout and
//! the cancel signal, so a wait that never returns cannot hang the caller.
//! The container is removed on every path.

use crate::docker::{ContainerSpec, DockerRuntime, TASK_LABEL, qualify_image};
use crate::plugins::{PluginResolver, ResolvedPlugin};
use crate::runner::{ExecutorConfig, OutputStream, collect_stream};
use async_trait::async_trait;
use chrono::Utc;
use sluice_core::events::{Event, LocalTaskFinishedPayload};
use sluice_core::ports::{CancelSignal, EventBus, LocalTaskRunner};
use sluice_core::status::TaskStatus;
use sluice_core::task::{EXIT_CODE_SENTINEL, LocalTask, TaskResult};
use sluice_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Removes the container if the executor is dropped mid-run.
struct ContainerGuard {
    runtime: Arc<dyn DockerRuntime>,
    id: Option<String>,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn DockerRuntime>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    /// Remove the container, giving up after `limit`. A removal that did
    /// not finish is retried in the background when the guard drops.
    async fn release(mut self, limit: Duration) {
        let Some(id) = self.id.clone() else {
            return;
        };
        match timeout(limit, self.runtime.remove(&id)).await {
            Ok(Ok(())) => self.id = None,
            Ok(Err(e)) => {
                warn!(container = %id, error = %e, "Failed to remove container");
                self.id = None;
            }
            Err(_) => warn!(container = %id, "Container removal did not finish in time"),
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = self.runtime.clone();
                handle.spawn(async move {
                    if let Err(e) = runtime.remove(&id).await {
                        warn!(container = %id, error = %e, "Failed to remove abandoned container");
                    }
                });
            }
            Err(_) => warn!(container = %id, "No runtime left to remove container"),
        }
    }
}

/// Resolves once the signal flips to true. A dropped sender never cancels.
async fn cancelled(signal: &mut CancelSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct LocalTaskExecutor {
    runtime: Arc<dyn DockerRuntime>,
    plugins: Option<Arc<dyn PluginResolver>>,
    bus: Option<Arc<dyn EventBus>>,
    config: ExecutorConfig,
}

impl LocalTaskExecutor {
    pub fn new(runtime: Arc<dyn DockerRuntime>, config: ExecutorConfig) -> Self {
        Self {
            runtime,
            plugins: None,
            bus: None,
            config,
        }
    }

    pub fn with_plugins(mut self, resolver: Arc<dyn PluginResolver>) -> Self {
        self.plugins = Some(resolver);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run a task to completion.
    ///
    /// Failures before the container starts (unknown plugin, bad inputs,
    /// image or container errors) are returned as errors. Once the container
    /// runs, every ending produces a [`TaskResult`].
    pub async fn execute(&self, mut task: LocalTask, mut cancel: CancelSignal) -> Result<TaskResult> {
        let started_at = Utc::now();

        let plugin = match task.plugin.clone() {
            Some(name) => Some(self.resolve_plugin(&name, &mut task.inputs).await?),
            None => None,
        };
        if let Some(plugin) = &plugin {
            task.script = Some(plugin.manifest.script.clone());
            if let Some(docker) = &plugin.manifest.docker {
                task = task.with_image(docker.image.clone());
            }
        }

        let spec = self.container_spec(&task, plugin.as_ref())?;
        info!(task = %task.name, task_id = %task.id, image = %spec.image, job_id = ?task.job_id, "Starting local task");

        self.runtime.ensure_image(&spec.image).await.map_err(pool_error)?;
        let container_id = self.runtime.create_and_start(&spec).await.map_err(pool_error)?;
        let guard = ContainerGuard::new(self.runtime.clone(), container_id.clone());

        let mut waiter = {
            let runtime = self.runtime.clone();
            let id = container_id.clone();
            tokio::spawn(async move { runtime.wait(&id).await })
        };

        let limit = Duration::from_secs(task.timeout_secs);
        let (status, exit_code, error) = tokio::select! {
            joined = &mut waiter => match joined {
                Ok(Ok(0)) => (TaskStatus::Success, 0, None),
                Ok(Ok(code)) => (TaskStatus::Failure, code, None),
                Ok(Err(e)) => (TaskStatus::Exception, EXIT_CODE_SENTINEL, Some(e.to_string())),
                Err(e) => (TaskStatus::Exception, EXIT_CODE_SENTINEL, Some(format!("container wait aborted: {e}"))),
            },
            _ = sleep(limit) => {
                warn!(task = %task.name, container = %container_id, timeout_secs = task.timeout_secs, "Local task timed out");
                waiter.abort();
                self.kill(&container_id).await;
                (TaskStatus::Timeout, EXIT_CODE_SENTINEL, None)
            }
            _ = cancelled(&mut cancel) => {
                info!(task = %task.name, container = %container_id, "Local task cancelled");
                waiter.abort();
                self.kill(&container_id).await;
                (TaskStatus::Cancelled, EXIT_CODE_SENTINEL, None)
            }
        };

        let grace = self.config.kill_grace();
        let lines = match timeout(grace, self.runtime.logs(&container_id, self.config.max_output_bytes)).await {
            Ok(Ok(lines)) => lines,
            Ok(Err(e)) => {
                warn!(container = %container_id, error = %e, "Failed to capture task output");
                Vec::new()
            }
            Err(_) => {
                warn!(container = %container_id, "Task output capture did not finish in time");
                Vec::new()
            }
        };
        guard.release(grace).await;
        drop(plugin);

        let result = TaskResult {
            task_id: task.id,
            name: task.name.clone(),
            job_id: task.job_id,
            status,
            exit_code,
            stdout: collect_stream(&lines, OutputStream::Stdout),
            stderr: collect_stream(&lines, OutputStream::Stderr),
            container_id: Some(container_id),
            error,
            started_at,
            finished_at: Utc::now(),
        };

        match result.status {
            TaskStatus::Exception => {
                error!(task = %result.name, error = ?result.error, "Local task failed unexpectedly")
            }
            status => info!(
                task = %result.name,
                status = %status,
                exit_code = result.exit_code,
                duration_ms = result.duration_ms(),
                "Local task finished"
            ),
        }
        self.publish(&result).await;
        Ok(result)
    }

    /// Remove task containers left behind by an earlier process.
    pub async fn remove_orphans(&self) -> Result<usize> {
        let label = format!("{TASK_LABEL}={}", self.config.container_prefix);
        let ids = self.runtime.list(&label).await?;
        let mut removed = 0;
        for id in ids {
            match self.runtime.remove(&id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %id, error = %e, "Failed to remove orphaned container"),
            }
        }
        if removed > 0 {
            info!(removed, "Removed orphaned task containers");
        }
        Ok(removed)
    }

    async fn resolve_plugin(
        &self,
        name: &str,
        inputs: &mut BTreeMap<String, String>,
    ) -> Result<ResolvedPlugin> {
        let resolver = self
            .plugins
            .clone()
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))?;

        let owned_name = name.to_string();
        let mut owned_inputs = std::mem::take(inputs);
        let (resolved, returned_inputs) = tokio::task::spawn_blocking(move || {
            let resolved = resolver.resolve(&owned_name, &mut owned_inputs);
            (resolved, owned_inputs)
        })
        .await
        .map_err(|e| Error::Internal(format!("plugin resolution aborted: {e}")))?;

        *inputs = returned_inputs;
        resolved
    }

    fn container_spec(&self, task: &LocalTask, plugin: Option<&ResolvedPlugin>) -> Result<ContainerSpec> {
        let script = task
            .script
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::InvalidInput(format!("task '{}' has nothing to run", task.name)))?;

        let image = task
            .docker
            .as_ref()
            .and_then(|d| d.image.clone())
            .unwrap_or_else(|| self.config.default_image.clone());

        let mut env: BTreeMap<String, String> = self.config.default_env().into_iter().collect();
        env.extend(task.inputs.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut cmd = self.config.shell.clone();
        cmd.push(script.to_string());

        let mut binds = Vec::new();
        if let Some(plugin) = plugin {
            binds.push(format!(
                "{}:{}/{}",
                plugin.path().display(),
                self.config.plugin_dir.trim_end_matches('/'),
                plugin.manifest.name
            ));
        } else if let Some(dir) = task.docker.as_ref().and_then(|d| d.plugin_dir.as_ref()) {
            binds.push(format!("{}:{}", dir.display(), self.config.plugin_dir));
        }

        Ok(ContainerSpec {
            name: format!("{}-{}", self.config.container_prefix, task.id),
            image: qualify_image(&image),
            cmd,
            env: env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
            working_dir: Some(self.config.workspace.clone()),
            binds,
            labels: HashMap::from([(TASK_LABEL.to_string(), self.config.container_prefix.clone())]),
        })
    }

    async fn kill(&self, container_id: &str) {
        match timeout(self.config.kill_grace(), self.runtime.kill(container_id)).await {
            Ok(Ok(())) => debug!(container = %container_id, "Container killed"),
            Ok(Err(e)) => warn!(container = %container_id, error = %e, "Failed to kill container"),
            Err(_) => warn!(
                container = %container_id,
                grace_secs = self.config.kill_grace_secs,
                "Container kill did not finish in time"
            ),
        }
    }

    async fn publish(&self, result: &TaskResult) {
        let Some(bus) = &self.bus else {
            return;
        };
        let event = Event::LocalTaskFinished(LocalTaskFinishedPayload {
            task_id: result.task_id,
            name: result.name.clone(),
            job_id: result.job_id,
            status: result.status,
            exit_code: result.exit_code,
            timestamp: result.finished_at,
        });
        if let Err(e) = bus.publish(event).await {
            warn!(task = %result.name, error = %e, "Failed to publish local task event");
        }
    }
}

fn pool_error(e: Error) -> Error {
    match e {
        Error::DockerPool(_) => e,
        other => Error::DockerPool(other.to_string()),
    }
}

#[async_trait]
impl LocalTaskRunner for LocalTaskExecutor {
    async fn run(&self, task: LocalTask, cancel: CancelSignal) -> Result<TaskResult> {
        self.execute(task, cancel).await
    }
}
