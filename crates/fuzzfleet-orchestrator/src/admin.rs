// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Administrative operations.
//!
//! Thin request objects, validated here and fed into the entity entrypoints.
//! Validation failures come back as [`Error`] values whose
//! [`Error::to_info`] is returned to the caller unchanged. Everything that
//! happens after validation is asynchronous and only visible through entity
//! state, errors and events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::models::scaleset::max_size_for_image;
use crate::models::{
    Architecture, AutoScaleConfig, Job, JobConfig, NewScaleset, Node, Os, Pool, ProxyForward,
    Repro, ReproConfig, Scaleset, Task, TaskConfig, UserInfo,
};
use crate::states::{JobState, ScalesetState};

// ============================================================================
// Pools
// ============================================================================

/// Request to create a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePoolRequest {
    /// Unique name.
    pub name: String,
    /// Operating system of every node.
    pub os: Os,
    /// CPU architecture.
    pub arch: Architecture,
    /// Nodes come from scalesets.
    pub managed: bool,
    /// Identity used by the pool's nodes.
    #[serde(default)]
    pub client_id: Option<Uuid>,
    /// Autoscale settings.
    #[serde(default)]
    pub autoscale: Option<AutoScaleConfig>,
}

/// Handle create pool request.
pub async fn handle_create_pool(ctx: &OrchestratorContext, request: CreatePoolRequest) -> Result<Pool> {
    if request.name.trim().is_empty() {
        return Err(Error::InvalidRequest("pool name must not be empty".to_string()));
    }
    if let Some(autoscale) = &request.autoscale {
        if !request.managed {
            return Err(Error::InvalidRequest(
                "autoscale requires a managed pool".to_string(),
            ));
        }
        if let Some(max) = autoscale.max_size
            && max < autoscale.min_size
        {
            return Err(Error::InvalidRequest(
                "autoscale max_size must not be below min_size".to_string(),
            ));
        }
    }

    Pool::create(
        ctx,
        &request.name,
        request.os,
        request.arch,
        request.managed,
        request.client_id,
        request.autoscale,
    )
    .await
}

/// Request to shut a pool down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownPoolRequest {
    /// Pool name.
    pub name: String,
    /// Halt immediately instead of draining.
    #[serde(default)]
    pub now: bool,
}

/// Handle shutdown pool request.
pub async fn handle_shutdown_pool(
    ctx: &OrchestratorContext,
    request: ShutdownPoolRequest,
) -> Result<Pool> {
    let pool = Pool::get_by_name(ctx, &request.name)
        .await?
        .ok_or_else(|| Error::UnableToFind(format!("unable to find pool: {}", request.name)))?;
    pool.set_shutdown(ctx, request.now).await
}

// ============================================================================
// Scalesets
// ============================================================================

/// Request to create a scaleset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateScalesetRequest {
    /// Owning pool.
    pub pool_name: String,
    /// VM size.
    pub vm_sku: String,
    /// Image.
    pub image: String,
    /// Region. Defaults to the base region.
    #[serde(default)]
    pub region: Option<String>,
    /// Requested node count.
    pub size: u32,
    /// Use spot instances.
    #[serde(default)]
    pub spot_instances: bool,
    /// Use ephemeral OS disks.
    #[serde(default = "default_true")]
    pub ephemeral_os_disks: bool,
    /// Tags applied to the VM scaleset.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// Handle create scaleset request.
pub async fn handle_create_scaleset(
    ctx: &OrchestratorContext,
    request: CreateScalesetRequest,
) -> Result<Scaleset> {
    let pool = Pool::get_by_name(ctx, &request.pool_name)
        .await?
        .ok_or_else(|| {
            Error::UnableToFind(format!("unable to find pool: {}", request.pool_name))
        })?;
    if !pool.managed {
        return Err(Error::UnableToCreate(
            "scalesets can only be added to managed pools".to_string(),
        ));
    }

    let max = max_size_for_image(&request.image);
    if request.size > max {
        return Err(Error::InvalidRequest(format!(
            "scaleset size {} exceeds the maximum of {max} for this image",
            request.size
        )));
    }

    let region = request
        .region
        .unwrap_or_else(|| ctx.config.base_region.clone());

    Scaleset::create(
        ctx,
        NewScaleset {
            pool_name: pool.name,
            vm_sku: request.vm_sku,
            image: request.image,
            region,
            size: request.size,
            spot_instances: request.spot_instances,
            ephemeral_os_disks: request.ephemeral_os_disks,
            tags: request.tags,
        },
    )
    .await
}

/// Request to resize a scaleset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeScalesetRequest {
    /// Scaleset.
    pub scaleset_id: Uuid,
    /// New node count.
    pub size: u32,
}

/// Handle resize scaleset request.
pub async fn handle_resize_scaleset(
    ctx: &OrchestratorContext,
    request: ResizeScalesetRequest,
) -> Result<Scaleset> {
    let scaleset = get_scaleset(ctx, request.scaleset_id).await?;
    if !scaleset.state.available() {
        return Err(Error::UnableToUpdate(format!(
            "scaleset must be in one of the following states to update: {}",
            ScalesetState::AVAILABLE
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    info!(scaleset_id = %scaleset.scaleset_id, size = request.size, "Scaleset resize requested");
    scaleset.set_size(ctx, request.size).await
}

/// Request to shut a scaleset down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownScalesetRequest {
    /// Scaleset.
    pub scaleset_id: Uuid,
    /// Halt immediately instead of draining.
    #[serde(default)]
    pub now: bool,
}

/// Handle shutdown scaleset request.
pub async fn handle_shutdown_scaleset(
    ctx: &OrchestratorContext,
    request: ShutdownScalesetRequest,
) -> Result<Scaleset> {
    let scaleset = get_scaleset(ctx, request.scaleset_id).await?;
    scaleset.set_shutdown(ctx, request.now).await
}

async fn get_scaleset(ctx: &OrchestratorContext, scaleset_id: Uuid) -> Result<Scaleset> {
    Scaleset::get_by_id(ctx, scaleset_id)
        .await?
        .ok_or_else(|| Error::UnableToFind(format!("unable to find scaleset: {scaleset_id}")))
}

// ============================================================================
// Jobs and tasks
// ============================================================================

/// Request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    /// Configuration.
    pub config: JobConfig,
    /// Requesting user.
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

/// Handle create job request.
pub async fn handle_create_job(ctx: &OrchestratorContext, request: CreateJobRequest) -> Result<Job> {
    Job::create(ctx, request.config, request.user_info).await
}

/// Handle stop job request.
///
/// Tasks are asked to stop; the job reaches `stopped` on a later pass once
/// they all have.
pub async fn handle_stop_job(ctx: &OrchestratorContext, job_id: Uuid) -> Result<Job> {
    let job = Job::get(ctx, job_id)
        .await?
        .ok_or_else(|| Error::UnableToFind(format!("unable to find job: {job_id}")))?;
    info!(job_id = %job_id, "Job stop requested");
    job.stopping(ctx).await
}

/// Request to create a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    /// Configuration.
    pub config: TaskConfig,
    /// Requesting user.
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

/// Handle create task request.
pub async fn handle_create_task(ctx: &OrchestratorContext, request: CreateTaskRequest) -> Result<Task> {
    let config = request.config;

    let job = Job::get(ctx, config.job_id)
        .await?
        .ok_or_else(|| Error::UnableToFind(format!("unable to find job: {}", config.job_id)))?;
    if !matches!(job.state, JobState::Init | JobState::Enabled) {
        return Err(Error::UnableToCreate(format!(
            "unable to add a task to a job in state {}",
            job.state
        )));
    }

    match (&config.pool, &config.vm) {
        (None, None) => {
            return Err(Error::InvalidRequest("task must have vm or pool".to_string()));
        }
        (Some(pool), _) if pool.count == 0 => {
            return Err(Error::InvalidRequest("pool count must be at least 1".to_string()));
        }
        (None, Some(vm)) if vm.count == 0 => {
            return Err(Error::InvalidRequest("vm count must be at least 1".to_string()));
        }
        _ => {}
    }
    if config.task.duration == 0 {
        return Err(Error::InvalidRequest("task duration must be at least 1 hour".to_string()));
    }

    for prereq_id in &config.prereq_tasks {
        let prereq = Task::get_by_task_id(ctx, *prereq_id).await?;
        if prereq.is_none_or(|t| t.job_id != config.job_id) {
            return Err(Error::InvalidRequest(format!(
                "unable to find prerequisite task in job: {prereq_id}"
            )));
        }
    }

    Task::create(ctx, config, request.user_info).await
}

/// Handle stop task request.
pub async fn handle_stop_task(ctx: &OrchestratorContext, task_id: Uuid) -> Result<Task> {
    let task = Task::get_by_task_id(ctx, task_id)
        .await?
        .ok_or_else(|| Error::UnableToFind(format!("unable to find task: {task_id}")))?;
    info!(job_id = %task.job_id, task_id = %task_id, "Task stop requested");
    task.mark_stopping(ctx).await
}

// ============================================================================
// Nodes
// ============================================================================

async fn get_node(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<Node> {
    Node::get_by_machine_id(ctx, machine_id)
        .await?
        .ok_or_else(|| Error::UnableToFind(format!("unable to find node: {machine_id}")))
}

/// Handle reimage node request.
pub async fn handle_reimage_node(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<Node> {
    let node = get_node(ctx, machine_id).await?;
    node.stop(ctx, false).await
}

/// Handle delete node request. The node drains before it is removed.
pub async fn handle_delete_node(ctx: &OrchestratorContext, machine_id: Uuid) -> Result<Node> {
    let node = get_node(ctx, machine_id).await?;
    node.set_halt(ctx).await
}

/// Request to authorize an SSH key on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddSshKeyRequest {
    /// Node.
    pub machine_id: Uuid,
    /// OpenSSH public key.
    pub public_key: String,
}

/// Handle add SSH key request.
pub async fn handle_add_ssh_key(ctx: &OrchestratorContext, request: AddSshKeyRequest) -> Result<()> {
    if request.public_key.trim().is_empty() {
        return Err(Error::InvalidRequest("public key must not be empty".to_string()));
    }
    let node = get_node(ctx, request.machine_id).await?;
    node.add_ssh_public_key(ctx, &request.public_key).await
}

// ============================================================================
// Repro and proxy forwards
// ============================================================================

/// Request to create a repro VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReproRequest {
    /// Task the crash came from.
    pub task_id: Uuid,
    /// What to reproduce.
    pub config: ReproConfig,
    /// Requesting user.
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

/// Handle create repro request.
pub async fn handle_create_repro(ctx: &OrchestratorContext, request: CreateReproRequest) -> Result<Repro> {
    if request.config.duration == 0 {
        return Err(Error::InvalidRequest("repro duration must be at least 1 hour".to_string()));
    }
    Repro::create(ctx, request.task_id, request.config, request.user_info).await
}

/// Request to forward a proxy port to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateForwardRequest {
    /// Scaleset of the node.
    pub scaleset_id: Uuid,
    /// Node.
    pub machine_id: Uuid,
    /// Port on the node.
    pub dst_port: u16,
    /// Lifetime in hours.
    pub duration: i64,
}

/// Handle create proxy forward request.
pub async fn handle_create_forward(
    ctx: &OrchestratorContext,
    request: CreateForwardRequest,
) -> Result<ProxyForward> {
    let scaleset = get_scaleset(ctx, request.scaleset_id).await?;
    let node = get_node(ctx, request.machine_id).await?;
    if node.scaleset_id != Some(scaleset.scaleset_id) {
        return Err(Error::InvalidRequest(format!(
            "node {} is not part of scaleset {}",
            node.machine_id, scaleset.scaleset_id
        )));
    }

    if request.duration <= 0 {
        return Err(Error::InvalidRequest("forward duration must be at least 1 hour".to_string()));
    }

    let Some(dst_ip) = ctx
        .cloud
        .vmss
        .get_instance_ip(scaleset.scaleset_id, node.machine_id)
        .await?
    else {
        return Err(Error::UnableToFind(format!(
            "unable to find instance ip for node: {}",
            node.machine_id
        )));
    };

    ProxyForward::create_forward(
        ctx,
        &scaleset.region,
        scaleset.scaleset_id,
        node.machine_id,
        &dst_ip,
        request.dst_port,
        request.duration,
    )
    .await
}
