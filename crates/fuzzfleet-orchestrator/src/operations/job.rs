// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job lifecycle operations.
//!
//! A job only moves forward (`init`, `enabled`, `stopping`, `stopped`) and
//! reaches `stopped` only once every one of its tasks has stopped.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fuzzfleet_store::{Entity, QueryFilter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::StateMachine;
use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::events::DomainEvent;
use crate::models::job::MAX_JOB_DURATION_HOURS;
use crate::models::{ErrorCode, ErrorInfo, Job, JobConfig, JobTaskInfo, Task, UserInfo};
use crate::states::{JobState, TaskState};

/// Enabled jobs that have not started after this long are stopped.
pub const JOB_NEVER_STARTED_DAYS: i64 = 30;

impl Job {
    /// Create a job in the `init` state.
    pub async fn create(
        ctx: &OrchestratorContext,
        config: JobConfig,
        user_info: Option<UserInfo>,
    ) -> Result<Job> {
        if config.duration == 0 || config.duration > MAX_JOB_DURATION_HOURS {
            return Err(Error::InvalidRequest(format!(
                "job duration must be between 1 and {MAX_JOB_DURATION_HOURS} hours"
            )));
        }

        let job = ctx.store.insert(Job::new(config, user_info)).await?;
        info!(job_id = %job.job_id, project = %job.config.project, name = %job.config.name, "Job created");

        ctx.send_event(DomainEvent::JobCreated {
            job_id: job.job_id,
            config: job.config.clone(),
            user_info: job.user_info.clone(),
        })
        .await;
        Ok(job)
    }

    /// Load a job.
    pub async fn get(ctx: &OrchestratorContext, job_id: Uuid) -> Result<Option<Job>> {
        let key = job_id.to_string();
        Ok(ctx.store.get(&key, &key).await?)
    }

    /// Jobs in any of `states` (or any state).
    pub async fn search_states(ctx: &OrchestratorContext, states: &[JobState]) -> Result<Vec<Job>> {
        let mut filter = QueryFilter::new();
        if !states.is_empty() {
            filter = filter.field_in("state", states.iter().copied());
        }
        Ok(ctx.store.query(&filter).await?)
    }

    /// Available jobs whose end time has passed.
    pub async fn search_expired(ctx: &OrchestratorContext) -> Result<Vec<Job>> {
        let now = Utc::now();
        Ok(Self::search_states(ctx, JobState::AVAILABLE)
            .await?
            .into_iter()
            .filter(|job| job.end_time.is_some_and(|end| end < now))
            .collect())
    }

    /// Move forward to `state`. Requests to go back are dropped.
    fn advance(&mut self, state: JobState) {
        if state.ordinal() < self.state.ordinal() {
            warn!(job_id = %self.job_id, from = %self.state, to = %state, "Refusing to move job backwards");
            return;
        }
        self.state = state;
    }

    /// Write the job back.
    pub async fn save(self, ctx: &OrchestratorContext) -> Result<Job> {
        Ok(ctx.store.replace(self).await?)
    }

    /// Enable the job.
    pub async fn init(mut self, ctx: &OrchestratorContext) -> Result<Job> {
        info!(job_id = %self.job_id, "Job init");
        self.advance(JobState::Enabled);
        self.save(ctx).await
    }

    /// Stop the job's tasks, and the job itself once they have all stopped.
    pub async fn stopping(mut self, ctx: &OrchestratorContext) -> Result<Job> {
        if self.state == JobState::Stopped {
            return Ok(self);
        }

        self.advance(JobState::Stopping);
        info!(job_id = %self.job_id, "Job stopping");

        let tasks = Task::search_states(ctx, Some(self.job_id), &[]).await?;
        let (stopped, not_stopped): (Vec<Task>, Vec<Task>) = tasks
            .into_iter()
            .partition(|task| task.state == TaskState::Stopped);

        if !not_stopped.is_empty() {
            debug!(job_id = %self.job_id, remaining = not_stopped.len(), "Waiting on tasks to stop");
            for task in not_stopped {
                task.mark_stopping(ctx).await?;
            }
            return self.save(ctx).await;
        }

        self.advance(JobState::Stopped);
        self.task_info = stopped.iter().map(task_summary).collect();
        let job = self.save(ctx).await?;
        info!(job_id = %job.job_id, tasks = job.task_info.len(), "Job stopped");

        ctx.send_event(DomainEvent::JobStopped {
            job_id: job.job_id,
            config: job.config.clone(),
            task_info: job.task_info.clone(),
        })
        .await;
        Ok(job)
    }

    /// Start the job clock on the first task start. Idempotent.
    pub async fn on_start(mut self, ctx: &OrchestratorContext) -> Result<Job> {
        if self.end_time.is_some() {
            return Ok(self);
        }
        self.end_time = Some(Utc::now() + Duration::hours(self.config.duration as i64));
        self.save(ctx).await
    }

    /// Per-task summaries for display.
    pub async fn with_task_info(mut self, ctx: &OrchestratorContext) -> Result<Job> {
        self.task_info = Task::search_states(ctx, Some(self.job_id), &[])
            .await?
            .iter()
            .map(task_summary)
            .collect();
        Ok(self)
    }

    /// Stop enabled jobs that never started within a month.
    pub async fn stop_never_started_jobs(ctx: &OrchestratorContext) -> Result<()> {
        let cutoff = Utc::now() - Duration::days(JOB_NEVER_STARTED_DAYS);
        let filter = QueryFilter::new()
            .field_eq("state", JobState::Enabled)
            .updated_before(cutoff);

        for job in ctx.store.query::<Job>(&filter).await? {
            if job.end_time.is_some() {
                continue;
            }

            let job_id = job.job_id;
            if let Err(e) = job.stop_never_started(ctx).await {
                e.log_entity_failure("job", job_id);
            }
        }
        Ok(())
    }

    async fn stop_never_started(self, ctx: &OrchestratorContext) -> Result<()> {
        for task in Task::search_states(ctx, Some(self.job_id), &[]).await? {
            let task_id = task.task_id;
            let error = ErrorInfo::new(ErrorCode::TaskFailed, "job never started");
            if let Err(e) = task.mark_failed(ctx, error).await {
                e.log_entity_failure("task", task_id);
            }
        }

        info!(job_id = %self.job_id, "Stopping job that never started");
        self.stopping(ctx).await?;
        Ok(())
    }

    /// Move enabled jobs whose tasks have all stopped to `stopping`.
    ///
    /// Jobs without any task are left alone.
    pub async fn stop_if_all_done(ctx: &OrchestratorContext) -> Result<()> {
        for job in Self::search_states(ctx, &[JobState::Enabled]).await? {
            let job_id = job.job_id;
            if let Err(e) = job.stop_if_done(ctx).await {
                e.log_entity_failure("job", job_id);
            }
        }
        Ok(())
    }

    async fn stop_if_done(self, ctx: &OrchestratorContext) -> Result<()> {
        let tasks = Task::search_states(ctx, Some(self.job_id), &[]).await?;
        if tasks.is_empty() || tasks.iter().any(|t| t.state != TaskState::Stopped) {
            return Ok(());
        }

        info!(job_id = %self.job_id, "All tasks stopped, stopping job");
        self.stopping(ctx).await?;
        Ok(())
    }
}

fn task_summary(task: &Task) -> JobTaskInfo {
    JobTaskInfo {
        task_id: task.task_id,
        task_type: task.config.task.task_type,
        error: task.error.clone(),
    }
}

#[async_trait]
impl StateMachine for Job {
    type State = JobState;

    fn state(&self) -> JobState {
        self.state
    }

    fn needs_work(&self) -> bool {
        self.state.needs_work()
    }

    async fn process_state_update(self, ctx: &OrchestratorContext) -> Result<Option<Self>> {
        debug!(table = Job::TABLE, job_id = %self.job_id, state = %self.state, "Processing job");
        let job = match self.state {
            JobState::Init => self.init(ctx).await?,
            JobState::Stopping => self.stopping(ctx).await?,
            _ => self,
        };
        Ok(Some(job))
    }
}
