// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker driving every state machine.
//!
//! Each pass runs, in order:
//! 1. Tasks: expire overdue tasks and jobs, process tasks and jobs that need
//!    work, stop finished and never-started jobs, then schedule waiting tasks.
//! 2. Workers: mark outdated nodes, process nodes, clean up and process
//!    scalesets, then process or autoscale pools.
//! 3. Repros: expire and process repro VMs.
//! 4. Proxies: health checks, processing, one proxy per active region.
//!
//! A failure on one entity is logged and the pass moves on to the next one.
//! Concurrency conflicts are expected when passes overlap and only logged at
//! `warn`; the next pass re-reads the entity and retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::autoscale::autoscale_pool;
use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::models::{Job, Node, Pool, Proxy, Repro, Scaleset, Task};
use crate::operations::{StateMachine, process_state_updates};
use crate::scheduler::schedule_tasks;
use crate::states::{JobState, NodeState, ScalesetState, TaskState, VmState};

/// Configuration for the reconcile worker.
#[derive(Debug, Clone)]
pub struct ReconcileWorkerConfig {
    /// How often to run a pass.
    pub poll_interval: Duration,
}

impl Default for ReconcileWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Background worker that runs reconciliation passes.
pub struct ReconcileWorker {
    ctx: OrchestratorContext,
    config: ReconcileWorkerConfig,
    shutdown: Arc<Notify>,
}

impl ReconcileWorker {
    /// Create a new reconcile worker.
    pub fn new(ctx: OrchestratorContext, config: ReconcileWorkerConfig) -> Self {
        Self {
            ctx,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Reconcile worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconcile worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = reconcile(&self.ctx).await {
                        error!(error = %e, "Reconcile pass failed");
                    }
                }
            }
        }

        info!("Reconcile worker stopped");
    }
}

fn log_sweep_failure(sweep: &'static str, e: &Error) {
    error!(sweep, error = %e, "Sweep failed");
}

/// Run one full pass.
///
/// Every stage runs even when an earlier one failed; the first failure is
/// returned.
pub async fn reconcile(ctx: &OrchestratorContext) -> Result<()> {
    let results = [
        ("tasks", process_tasks(ctx).await),
        ("workers", process_workers(ctx).await),
        ("repros", process_repros(ctx).await),
        ("proxies", process_proxies(ctx).await),
    ];

    let mut first = None;
    for (stage, result) in results {
        if let Err(e) = result {
            error!(stage, error = %e, "Reconcile stage failed");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Expire, process and schedule tasks and jobs.
pub async fn process_tasks(ctx: &OrchestratorContext) -> Result<()> {
    for task in Task::search_expired(ctx).await? {
        let id = task.task_id;
        info!(job_id = %task.job_id, task_id = %id, "Stopping expired task");
        if let Err(e) = task.mark_stopping(ctx).await {
            e.log_entity_failure("task", id);
        }
    }

    for job in Job::search_expired(ctx).await? {
        let id = job.job_id;
        info!(job_id = %id, "Stopping expired job");
        if let Err(e) = job.stopping(ctx).await {
            e.log_entity_failure("job", id);
        }
    }

    for task in Task::search_states(ctx, None, TaskState::NEEDS_WORK).await? {
        let id = task.task_id;
        if let Err(e) = process_state_updates(ctx, task).await {
            e.log_entity_failure("task", id);
        }
    }

    for job in Job::search_states(ctx, JobState::NEEDS_WORK).await? {
        let id = job.job_id;
        if let Err(e) = process_state_updates(ctx, job).await {
            e.log_entity_failure("job", id);
        }
    }

    if let Err(e) = Job::stop_if_all_done(ctx).await {
        log_sweep_failure("stop_finished_jobs", &e);
    }
    if let Err(e) = Job::stop_never_started_jobs(ctx).await {
        log_sweep_failure("stop_never_started_jobs", &e);
    }

    match schedule_tasks(ctx).await {
        Ok(0) => {}
        Ok(scheduled) => debug!(scheduled, "Tasks scheduled"),
        Err(e) => log_sweep_failure("schedule_tasks", &e),
    }
    Ok(())
}

/// Process nodes, scalesets and pools.
pub async fn process_workers(ctx: &OrchestratorContext) -> Result<()> {
    if let Err(e) = Node::mark_outdated_nodes(ctx).await {
        log_sweep_failure("outdated_nodes", &e);
    }
    if let Err(e) = Node::cleanup_busy_nodes_without_work(ctx).await {
        log_sweep_failure("busy_nodes_without_work", &e);
    }

    for node in Node::search_states(ctx, None, NodeState::NEEDS_WORK).await? {
        let id = node.machine_id;
        if let Err(e) = process_state_updates(ctx, node).await {
            e.log_entity_failure("node", id);
        }
    }

    for scaleset in Scaleset::search_states(ctx, &[]).await? {
        let id = scaleset.scaleset_id;
        if let Err(e) = process_scaleset(ctx, scaleset).await {
            e.log_entity_failure("scaleset", id);
        }
    }

    for pool in Pool::search_states(ctx, &[]).await? {
        let name = pool.name.clone();
        if let Err(e) = process_pool(ctx, pool).await {
            e.log_entity_failure("pool", name);
        }
    }
    Ok(())
}

/// Clean up a scaleset's nodes, then advance it.
///
/// When the cleanup touched nodes the scaleset waits for the next pass so the
/// cloud can settle first. A draining scaleset always moves on.
pub async fn process_scaleset(ctx: &OrchestratorContext, scaleset: Scaleset) -> Result<()> {
    debug!(scaleset_id = %scaleset.scaleset_id, state = %scaleset.state, "Checking scaleset for updates");

    let (scaleset, modified) = scaleset.cleanup_nodes(ctx).await?;
    let Some(scaleset) = scaleset else {
        return Ok(());
    };
    if modified && scaleset.state != ScalesetState::Shutdown {
        return Ok(());
    }

    let Some(scaleset) = process_state_updates(ctx, scaleset).await? else {
        return Ok(());
    };
    let scaleset = scaleset.sync_scaleset_size(ctx).await?;
    scaleset.update_configs(ctx).await?;
    Ok(())
}

async fn process_pool(ctx: &OrchestratorContext, pool: Pool) -> Result<()> {
    if pool.needs_work() {
        process_state_updates(ctx, pool).await?;
        return Ok(());
    }

    if pool.state.available() && pool.autoscale.is_some() {
        autoscale_pool(ctx, &pool).await?;
    }
    Ok(())
}

/// Expire and process repro VMs.
pub async fn process_repros(ctx: &OrchestratorContext) -> Result<()> {
    for mut repro in Repro::search_expired(ctx).await? {
        let id = repro.vm_id;
        info!(vm_id = %id, "Stopping expired repro");
        repro.state = VmState::Stopping;
        if let Err(e) = repro.save(ctx).await {
            e.log_entity_failure("repro", id);
        }
    }

    for repro in Repro::search_states(ctx, VmState::NEEDS_WORK).await? {
        let id = repro.vm_id;
        if let Err(e) = process_state_updates(ctx, repro).await {
            e.log_entity_failure("repro", id);
        }
    }
    Ok(())
}

/// Check proxy health, process proxies and cover every active region.
pub async fn process_proxies(ctx: &OrchestratorContext) -> Result<()> {
    for proxy in Proxy::search_states(ctx, &[]).await? {
        let region = proxy.region.clone();
        if let Err(e) = process_proxy(ctx, proxy).await {
            e.log_entity_failure("proxy", region);
        }
    }

    Proxy::ensure_regions(ctx).await
}

async fn process_proxy(ctx: &OrchestratorContext, proxy: Proxy) -> Result<()> {
    let proxy = proxy.check_health(ctx).await?;
    if proxy.needs_work() {
        process_state_updates(ctx, proxy).await?;
    }
    Ok(())
}
