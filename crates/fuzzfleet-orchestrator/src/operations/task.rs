// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task lifecycle operations.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fuzzfleet_store::QueryFilter;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::StateMachine;
use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::events::DomainEvent;
use crate::models::{
    ErrorCode, ErrorInfo, Job, Node, NodeTasks, Pool, Scaleset, Task, TaskConfig, TaskVm,
    UserInfo,
};
use crate::states::TaskState;

impl Task {
    /// Create a task in the `init` state.
    ///
    /// The OS comes from the VM image for dedicated VMs, or from the pool.
    pub async fn create(
        ctx: &OrchestratorContext,
        config: TaskConfig,
        user_info: Option<UserInfo>,
    ) -> Result<Task> {
        let os = if let Some(vm) = &config.vm {
            ctx.cloud
                .vmss
                .get_image_os(&vm.region, &vm.image)
                .await?
                .ok_or_else(|| {
                    Error::InvalidRequest(format!("unable to determine os of image: {}", vm.image))
                })?
        } else if let Some(task_pool) = &config.pool {
            Pool::get_by_name(ctx, &task_pool.pool_name)
                .await?
                .ok_or_else(|| {
                    Error::UnableToFind(format!("unable to find pool: {}", task_pool.pool_name))
                })?
                .os
        } else {
            return Err(Error::InvalidRequest(
                "task must have vm or pool".to_string(),
            ));
        };

        let task = ctx
            .store
            .insert(Task::new(config.job_id, os, config, user_info))
            .await?;
        info!(job_id = %task.job_id, task_id = %task.task_id, os = %task.os, "Task created");

        ctx.send_event(DomainEvent::TaskCreated {
            job_id: task.job_id,
            task_id: task.task_id,
            config: task.config.clone(),
            user_info: task.user_info.clone(),
        })
        .await;
        Ok(task)
    }

    /// Look a task up by id alone.
    pub async fn get_by_task_id(ctx: &OrchestratorContext, task_id: Uuid) -> Result<Option<Task>> {
        Ok(ctx
            .store
            .query_one(&QueryFilter::new().field_eq("task_id", task_id.to_string()))
            .await?)
    }

    /// Tasks of a job (or all tasks) in any of `states` (or any state).
    pub async fn search_states(
        ctx: &OrchestratorContext,
        job_id: Option<Uuid>,
        states: &[TaskState],
    ) -> Result<Vec<Task>> {
        let mut filter = QueryFilter::new();
        if let Some(id) = job_id {
            filter = filter.partition(id.to_string());
        }
        if !states.is_empty() {
            filter = filter.field_in("state", states.iter().copied());
        }
        Ok(ctx.store.query(&filter).await?)
    }

    /// Available tasks whose end time has passed.
    pub async fn search_expired(ctx: &OrchestratorContext) -> Result<Vec<Task>> {
        let now = Utc::now();
        Ok(Self::search_states(ctx, None, TaskState::AVAILABLE)
            .await?
            .into_iter()
            .filter(|task| task.end_time.is_some_and(|end| end < now))
            .collect())
    }

    /// Available tasks that run on `pool_name`.
    pub async fn get_tasks_by_pool_name(
        ctx: &OrchestratorContext,
        pool_name: &str,
    ) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for task in Self::search_states(ctx, None, TaskState::AVAILABLE).await? {
            let matches = match &task.config.pool {
                Some(task_pool) => task_pool.pool_name == pool_name,
                None => task
                    .get_pool(ctx)
                    .await?
                    .is_some_and(|pool| pool.name == pool_name),
            };
            if matches {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Name of the task's own work queue.
    pub fn queue_name(&self) -> String {
        self.task_id.simple().to_string()
    }

    /// Write the task back.
    pub async fn save(self, ctx: &OrchestratorContext) -> Result<Task> {
        Ok(ctx.store.replace(self).await?)
    }

    /// Move to `state`, emitting `task-state-updated` when it changed.
    pub async fn set_state(mut self, ctx: &OrchestratorContext, state: TaskState) -> Result<Task> {
        let changed = self.state != state;
        self.state = state;
        let task = self.save(ctx).await?;
        if changed {
            ctx.send_event(DomainEvent::TaskStateUpdated {
                job_id: task.job_id,
                task_id: task.task_id,
                state,
                end_time: task.end_time,
            })
            .await;
        }
        Ok(task)
    }

    /// Create the task queue and wait for scheduling.
    pub async fn init(self, ctx: &OrchestratorContext) -> Result<Task> {
        ctx.queue.create_queue(&self.queue_name()).await?;
        self.set_state(ctx, TaskState::Waiting).await
    }

    /// Tear the task down and move it to `stopped`.
    pub async fn stopping(mut self, ctx: &OrchestratorContext) -> Result<Task> {
        info!(job_id = %self.job_id, task_id = %self.task_id, "Stopping task");
        self.state = TaskState::Stopping;

        ctx.queue.delete_queue(&self.queue_name()).await?;
        Node::stop_task(ctx, self.task_id).await?;

        for entry in NodeTasks::get_by_task_id(ctx, self.task_id).await? {
            let keep = Node::get_by_machine_id(ctx, entry.machine_id)
                .await?
                .is_some_and(|node| node.debug_keep_node);
            if keep {
                debug!(task_id = %self.task_id, machine_id = %entry.machine_id, "Keeping node task for debugging");
                continue;
            }
            ctx.store.delete(&entry).await?;
        }

        self.state = TaskState::Stopped;
        let task = self.save(ctx).await?;

        let event = match &task.error {
            Some(error) => DomainEvent::TaskFailed {
                job_id: task.job_id,
                task_id: task.task_id,
                error: error.clone(),
            },
            None => DomainEvent::TaskStopped {
                job_id: task.job_id,
                task_id: task.task_id,
            },
        };
        ctx.send_event(event).await;
        Ok(task)
    }

    /// Request the task to stop. Tasks already shutting down are unchanged.
    pub async fn mark_stopping(self, ctx: &OrchestratorContext) -> Result<Task> {
        if self.state.shutting_down() {
            debug!(task_id = %self.task_id, state = %self.state, "Task already shutting down");
            return Ok(self);
        }
        self.set_state(ctx, TaskState::Stopping).await
    }

    /// Record `error` and stop the task. Ignored once the task is shutting down.
    pub async fn mark_failed(mut self, ctx: &OrchestratorContext, error: ErrorInfo) -> Result<Task> {
        if self.state.shutting_down() {
            info!(
                task_id = %self.task_id,
                error = %error,
                "Ignoring post-task stop failure"
            );
            return Ok(self);
        }

        self.error = Some(error);
        self.set_state(ctx, TaskState::Stopping).await
    }

    /// Check that every prerequisite task has started.
    ///
    /// A missing prerequisite fails this task.
    pub async fn ready_to_schedule(mut self, ctx: &OrchestratorContext) -> Result<(Task, bool)> {
        for prereq_id in self.config.prereq_tasks.clone() {
            match Self::get_by_task_id(ctx, prereq_id).await? {
                None => {
                    info!(task_id = %self.task_id, prereq_id = %prereq_id, "Task prerequisite missing");
                    self.error = Some(ErrorInfo::new(
                        ErrorCode::InvalidRequest,
                        format!("unable to find prerequisite task: {prereq_id}"),
                    ));
                    let task = self.set_state(ctx, TaskState::Stopping).await?;
                    return Ok((task, false));
                }
                Some(prereq) if !prereq.state.has_started() => {
                    debug!(task_id = %self.task_id, prereq_id = %prereq_id, "Task waiting on prerequisite");
                    return Ok((self, false));
                }
                Some(_) => {}
            }
        }
        Ok((self, true))
    }

    /// Start the task clock on the first start. Idempotent.
    pub async fn on_start(mut self, ctx: &OrchestratorContext) -> Result<Task> {
        if self.end_time.is_some() {
            return Ok(self);
        }

        self.end_time = Some(Utc::now() + Duration::hours(self.config.task.duration as i64));
        let task = self.save(ctx).await?;

        if let Some(job) = Job::get(ctx, task.job_id).await? {
            job.on_start(ctx).await?;
        }
        Ok(task)
    }

    /// Pool the task runs on.
    ///
    /// For dedicated VMs this is the pool of the first scaleset with the same
    /// SKU and image.
    pub async fn get_pool(&self, ctx: &OrchestratorContext) -> Result<Option<Pool>> {
        if let Some(task_pool) = &self.config.pool {
            let pool = Pool::get_by_name(ctx, &task_pool.pool_name).await?;
            if pool.is_none() {
                info!(task_id = %self.task_id, pool_name = %task_pool.pool_name, "Unable to schedule task to pool");
            }
            return Ok(pool);
        }

        if let Some(vm) = &self.config.vm {
            let scalesets: Vec<Scaleset> = ctx.store.query(&QueryFilter::new()).await?;
            for scaleset in scalesets
                .into_iter()
                .filter(|s| s.vm_sku == vm.sku && s.image == vm.image)
            {
                if let Some(pool) = Pool::get_by_name(ctx, &scaleset.pool_name).await? {
                    return Ok(Some(pool));
                }
            }
        }

        warn!(task_id = %self.task_id, "Unable to find a scaleset that matches the task prereqs");
        Ok(None)
    }

    /// VM settings for a repro of this task.
    pub async fn get_repro_vm_config(&self, ctx: &OrchestratorContext) -> Result<Option<TaskVm>> {
        if let Some(vm) = &self.config.vm {
            return Ok(Some(vm.clone()));
        }

        let Some(task_pool) = &self.config.pool else {
            return Err(Error::InvalidRequest(format!(
                "either pool or vm must be specified: {}",
                self.task_id
            )));
        };

        if Pool::get_by_name(ctx, &task_pool.pool_name).await?.is_none() {
            info!(task_id = %self.task_id, "Unable to find pool from task");
            return Ok(None);
        }

        if let Some(scaleset) = Scaleset::search_by_pool(ctx, &task_pool.pool_name)
            .await?
            .into_iter()
            .next()
        {
            return Ok(Some(TaskVm {
                region: scaleset.region,
                sku: scaleset.vm_sku,
                image: scaleset.image,
                count: 1,
                spot_instances: false,
                reboot_after_setup: None,
            }));
        }

        warn!(job_id = %self.job_id, task_id = %self.task_id, "No scalesets are defined for task");
        Ok(None)
    }

    /// Fill in the node assignments for display.
    pub async fn with_nodes(mut self, ctx: &OrchestratorContext) -> Result<Task> {
        self.nodes = NodeTasks::get_node_assignments(ctx, self.task_id).await?;
        Ok(self)
    }
}

#[async_trait]
impl StateMachine for Task {
    type State = TaskState;

    fn state(&self) -> TaskState {
        self.state
    }

    fn needs_work(&self) -> bool {
        self.state.needs_work()
    }

    async fn process_state_update(self, ctx: &OrchestratorContext) -> Result<Option<Self>> {
        let task = match self.state {
            TaskState::Init => self.init(ctx).await?,
            TaskState::Stopping => self.stopping(ctx).await?,
            _ => self,
        };
        Ok(Some(task))
    }
}
