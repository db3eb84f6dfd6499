// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task scheduling.
//!
//! Waiting tasks whose prerequisites have started are grouped into buckets of
//! tasks that can share a node, split into work sets of at most
//! [`MAX_TASKS_PER_SET`] units and posted to the pool work queue once per
//! requested VM. Agents pull work sets from that queue through
//! [`receive_work`] and confirm each task with [`can_schedule`].

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::models::{Node, Os, Pool, Task, WorkSet, WorkUnit};
use crate::states::{PoolState, TaskState};

/// Upper bound on work units in one work set.
pub const MAX_TASKS_PER_SET: usize = 10;

/// Tasks sharing a key may run on the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    os: Os,
    job_id: Uuid,
    vm: Option<(String, String)>,
    pool: Option<String>,
    setup_container: Option<String>,
    reboot: bool,
    unique: Option<Uuid>,
}

impl BucketKey {
    /// Key for `task`.
    ///
    /// Only colocatable tasks that need a single node share buckets; every
    /// other task gets a key of its own.
    pub fn for_task(task: &Task) -> Self {
        let config = &task.config;
        let count = task_count(task);
        let unique = if count > 1 || config.colocate != Some(true) {
            Some(Uuid::new_v4())
        } else {
            None
        };

        Self {
            os: task.os,
            job_id: task.job_id,
            vm: config
                .vm
                .as_ref()
                .map(|vm| (vm.sku.clone(), vm.image.clone())),
            pool: config.pool.as_ref().map(|p| p.pool_name.clone()),
            setup_container: config.setup_container().map(str::to_string),
            reboot: reboot_after_setup(task),
            unique,
        }
    }
}

/// Number of nodes the task asks for.
pub fn task_count(task: &Task) -> u32 {
    match (&task.config.pool, &task.config.vm) {
        (Some(pool), _) => pool.count,
        (None, Some(vm)) => vm.count,
        (None, None) => 1,
    }
}

fn reboot_after_setup(task: &Task) -> bool {
    task.config
        .vm
        .as_ref()
        .and_then(|vm| vm.reboot_after_setup)
        .or(task.config.task.reboot_after_setup)
        .unwrap_or(false)
}

/// Group tasks by [`BucketKey`], keeping first-seen order.
pub fn bucket_tasks(tasks: Vec<Task>) -> Vec<(BucketKey, Vec<Task>)> {
    let mut buckets: Vec<(BucketKey, Vec<Task>)> = Vec::new();
    for task in tasks {
        let key = BucketKey::for_task(&task);
        match buckets.iter_mut().find(|(k, _)| *k == key) {
            Some((_, bucket)) => bucket.push(task),
            None => buckets.push((key, vec![task])),
        }
    }
    buckets
}

fn build_work_set(key: &BucketKey, tasks: &[Task]) -> Result<WorkSet> {
    let work_units = tasks
        .iter()
        .map(|task| {
            Ok(WorkUnit {
                job_id: task.job_id,
                task_id: task.task_id,
                task_type: task.config.task.task_type,
                config: serde_json::to_string(&task.config)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(WorkSet {
        reboot: key.reboot,
        setup_container: key.setup_container.clone(),
        script: false,
        work_units,
    })
}

/// Post the work set `count` times. `false` once the pool refuses one.
async fn schedule_workset(
    ctx: &OrchestratorContext,
    pool: &Pool,
    work_set: &WorkSet,
    count: u32,
) -> Result<bool> {
    if pool.state != PoolState::Running {
        debug!(pool_name = %pool.name, state = %pool.state, "Pool not accepting work yet");
        return Ok(false);
    }

    for _ in 0..count {
        if !pool.schedule_workset(ctx, work_set).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Schedule every waiting task that is ready. Returns the number scheduled.
pub async fn schedule_tasks(ctx: &OrchestratorContext) -> Result<usize> {
    let waiting = Task::search_states(ctx, None, &[TaskState::Waiting]).await?;
    let total = waiting.len();

    let mut ready = Vec::with_capacity(total);
    for task in waiting {
        let task_id = task.task_id;
        match task.ready_to_schedule(ctx).await {
            Ok((task, true)) => ready.push(task),
            Ok((_, false)) => {}
            Err(e) => e.log_entity_failure("task", task_id),
        }
    }

    let mut scheduled = 0;
    for (key, mut bucket) in bucket_tasks(ready) {
        while !bucket.is_empty() {
            let take = bucket.len().min(MAX_TASKS_PER_SET);
            let chunk: Vec<Task> = bucket.drain(..take).collect();

            match schedule_chunk(ctx, &key, chunk).await {
                Ok(count) => scheduled += count,
                Err(e) => error!(error = %e, "Failed to schedule work set"),
            }
        }
    }

    if scheduled < total {
        info!(not_ready = total - scheduled, "Tasks not ready to schedule");
    }
    Ok(scheduled)
}

/// Post one work set and mark its tasks scheduled. Returns the number of
/// tasks marked.
async fn schedule_chunk(ctx: &OrchestratorContext, key: &BucketKey, chunk: Vec<Task>) -> Result<usize> {
    let Some(pool) = chunk[0].get_pool(ctx).await? else {
        return Ok(0);
    };

    let work_set = build_work_set(key, &chunk)?;
    let count = task_count(&chunk[0]);
    if !schedule_workset(ctx, &pool, &work_set, count).await? {
        return Ok(0);
    }

    let mut scheduled = 0;
    for task in chunk {
        info!(
            job_id = %task.job_id,
            task_id = %task.task_id,
            pool_name = %pool.name,
            count,
            "Task scheduled"
        );
        let task_id = task.task_id;
        match task.set_state(ctx, TaskState::Scheduled).await {
            Ok(_) => scheduled += 1,
            Err(e) => e.log_entity_failure("task", task_id),
        }
    }
    Ok(scheduled)
}

/// Answer to an agent asking whether it may run a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanSchedule {
    /// The node may start the task.
    pub allowed: bool,
    /// The task has stopped or is gone; the work should be dropped.
    pub work_stopped: bool,
}

/// Check that `machine_id` may start `task_id`.
///
/// Allowed nodes get scale-in protection so the autoscaler leaves them alone
/// while they work.
pub async fn can_schedule(
    ctx: &OrchestratorContext,
    machine_id: Uuid,
    task_id: Uuid,
) -> Result<CanSchedule> {
    let Some(node) = Node::get_by_machine_id(ctx, machine_id).await? else {
        return Err(Error::InvalidRequest(format!(
            "unable to find node: {machine_id}"
        )));
    };

    let (node, mut allowed) = node.can_process_new_work(ctx).await?;

    let work_stopped = match Task::get_by_task_id(ctx, task_id).await? {
        Some(task) => task.state.shutting_down(),
        None => {
            warn!(machine_id = %machine_id, task_id = %task_id, "Agent asked to run unknown task");
            true
        }
    };
    if work_stopped {
        allowed = false;
    }

    if allowed && let Err(e) = node.acquire_scale_in_protection(ctx).await {
        warn!(machine_id = %machine_id, error = %e, "Failed to acquire scale-in protection");
        allowed = false;
    }

    Ok(CanSchedule {
        allowed,
        work_stopped,
    })
}

/// Hand the next work set of the node's pool to an agent.
///
/// `None` when the node may not take work or the queue is empty.
pub async fn receive_work(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<Option<WorkSet>> {
    let Some(node) = Node::get_by_machine_id(ctx, machine_id).await? else {
        return Err(Error::InvalidRequest(format!(
            "unable to find node: {machine_id}"
        )));
    };

    let (node, allowed) = node.can_process_new_work(ctx).await?;
    if !allowed {
        return Ok(None);
    }

    let Some(pool) = Pool::get_by_name(ctx, &node.pool_name).await? else {
        return Ok(None);
    };

    let queue_name = pool.work_queue_name();
    let Some(raw) = ctx.queue.receive_message(&queue_name).await? else {
        return Ok(None);
    };
    let work_set: WorkSet = serde_json::from_str(&raw)?;

    // the work set goes back to the pool when the node cannot be protected
    if let Err(e) = node.acquire_scale_in_protection(ctx).await {
        warn!(machine_id = %machine_id, error = %e, "Failed to acquire scale-in protection, returning work set");
        ctx.queue.send_message(&queue_name, raw).await?;
        return Err(e);
    }
    debug!(
        machine_id = %machine_id,
        units = work_set.work_units.len(),
        "Work set handed to node"
    );
    Ok(Some(work_set))
}
