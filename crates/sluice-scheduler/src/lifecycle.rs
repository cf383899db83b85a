//! Job lifecycle.
//!
//! Legal job transitions and the actions bound to them. Every transition
//! persists the job snapshot and publishes a status event; landing on a
//! terminal status also publishes `JobFinished`.

use async_trait::async_trait;
use chrono::Utc;
use sluice_core::events::*;
use sluice_core::job::Job;
use sluice_core::ports::{EventBus, JobRepository};
use sluice_core::sm::{Action, Context, Outcome, StateMachine};
use sluice_core::status::JobStatus;
use sluice_core::{Error, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Transition payload: the job being moved.
pub struct JobChange {
    pub job: Job,
}

/// Legal targets per status.
pub const JOB_TRANSITIONS: &[(JobStatus, &[JobStatus])] = {
    use JobStatus::*;
    &[
        (Pending, &[Created, Cancelled]),
        (Created, &[Queued, Timeout, Failure]),
        (Queued, &[Running, Cancelled, Timeout, Failure]),
        (Running, &[Success, Cancelling, Cancelled, Timeout, Failure]),
        (Cancelling, &[Cancelled]),
    ]
};

struct RecordStatus {
    repository: Arc<dyn JobRepository>,
    bus: Arc<dyn EventBus>,
}

#[async_trait]
impl Action<JobStatus, JobChange> for RecordStatus {
    async fn accept(&self, ctx: &mut Context<JobStatus, JobChange>) -> Result<()> {
        let (from, to) = (ctx.current(), ctx.to());
        let cause = ctx.error().map(|e| e.to_string());
        let job = &mut ctx.payload.job;

        job.status = to;
        let now = Utc::now();
        if to == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.finished_at = Some(now);
        }
        if cause.is_some() {
            job.error = cause.clone();
        }

        self.repository.save_job(job).await?;

        info!(job_id = %job.id, from = %from, to = %to, "Job status changed");
        let event = Event::JobStatusChanged(JobStatusChangedPayload {
            job_id: job.id,
            pipeline: job.pipeline.clone(),
            from,
            to,
            error: cause,
            timestamp: now,
        });
        if let Err(e) = self.bus.publish(event).await {
            warn!(job_id = %job.id, error = %e, "Failed to publish job status event");
        }
        Ok(())
    }

    async fn on_error(&self, ctx: &mut Context<JobStatus, JobChange>) {
        if let Some(e) = ctx.error() {
            error!(
                job_id = %ctx.payload.job.id,
                from = %ctx.current(),
                to = %ctx.to(),
                error = %e,
                "Job transition failed"
            );
        }
    }
}

struct PublishFinished {
    bus: Arc<dyn EventBus>,
}

#[async_trait]
impl Action<JobStatus, JobChange> for PublishFinished {
    async fn accept(&self, ctx: &mut Context<JobStatus, JobChange>) -> Result<()> {
        let job = &ctx.payload.job;
        let duration_ms = job
            .started_at
            .zip(job.finished_at)
            .map(|(start, end)| (end - start).num_milliseconds());

        self.bus
            .publish(Event::JobFinished(JobFinishedPayload {
                job_id: job.id,
                pipeline: job.pipeline.clone(),
                status: job.status,
                error: job.error.clone(),
                duration_ms,
                timestamp: Utc::now(),
            }))
            .await
    }
}

pub struct JobLifecycle {
    machine: StateMachine<JobStatus, JobChange>,
}

impl JobLifecycle {
    pub fn new(repository: Arc<dyn JobRepository>, bus: Arc<dyn EventBus>) -> Result<Self> {
        let record: Arc<dyn Action<JobStatus, JobChange>> = Arc::new(RecordStatus {
            repository,
            bus: bus.clone(),
        });

        let mut machine = StateMachine::new("job");
        for (from, targets) in JOB_TRANSITIONS {
            machine.add_row(*from, targets, record.clone())?;
        }
        machine.add_hook_on_target(
            &[
                JobStatus::Success,
                JobStatus::Failure,
                JobStatus::Timeout,
                JobStatus::Cancelled,
            ],
            Arc::new(PublishFinished { bus }),
        );

        Ok(Self { machine })
    }

    pub fn machine(&self) -> &StateMachine<JobStatus, JobChange> {
        &self.machine
    }

    pub fn can_transition(&self, from: JobStatus, to: JobStatus) -> bool {
        self.machine.is_legal(from, to)
    }

    /// Move `job` to `to`, recording `cause` as the job error. The job is
    /// only updated when the transition applies.
    pub async fn transition(&self, job: &mut Job, to: JobStatus, cause: Option<Error>) -> Result<()> {
        let mut ctx = Context::new(job.status, JobChange { job: job.clone() });
        if let Some(cause) = cause {
            ctx.set_error(cause);
        }

        match self.machine.execute(&mut ctx, to).await? {
            Outcome::Applied => {
                *job = ctx.into_payload().job;
                Ok(())
            }
            Outcome::Skipped => Ok(()),
            Outcome::Failed => Err(ctx
                .take_error()
                .unwrap_or_else(|| Error::Internal("job transition failed".into()))),
        }
    }
}
