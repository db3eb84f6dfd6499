// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool autoscaling.
//!
//! Pools with an [`AutoScaleConfig`] are sized from the node count requested
//! by their not-yet-stopped tasks. Growth fills existing scalesets first and
//! creates new ones for the rest; shrinking resizes scalesets that have free
//! nodes and shuts down scalesets that are entirely free.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::context::OrchestratorContext;
use crate::error::Result;
use crate::models::scaleset::max_size_for_image;
use crate::models::{AutoScaleConfig, NewScaleset, Node, Pool, Scaleset, Task};
use crate::scheduler::task_count;
use crate::states::{NodeState, ScalesetState};

/// Nodes the pool should have for `requested` task nodes.
pub fn target_size(requested: u32, config: &AutoScaleConfig) -> u32 {
    let size = requested.max(config.min_size);
    match config.max_size {
        Some(max) => size.min(max),
        None => size,
    }
}

/// Scalesets whose size counts toward the pool's current capacity.
fn counts_toward_capacity(state: ScalesetState) -> bool {
    !matches!(
        state,
        ScalesetState::Shutdown | ScalesetState::Halt | ScalesetState::CreationFailed
    )
}

async fn scale_up(
    ctx: &OrchestratorContext,
    pool: &Pool,
    config: &AutoScaleConfig,
    scalesets: Vec<Scaleset>,
    mut needed: u32,
) -> Result<()> {
    info!(pool_name = %pool.name, needed, "Scaling up pool");

    for scaleset in scalesets {
        if needed == 0 {
            return Ok(());
        }
        if !matches!(scaleset.state, ScalesetState::Running | ScalesetState::Resize) {
            continue;
        }

        let max = scaleset.max_size().min(config.scaleset_size);
        if scaleset.size >= max {
            continue;
        }

        let grow = (max - scaleset.size).min(needed);
        let new_size = scaleset.size + grow;
        info!(scaleset_id = %scaleset.scaleset_id, size = new_size, "Growing scaleset");
        scaleset.set_size(ctx, new_size).await?;
        needed -= grow;
    }

    let per_scaleset = max_size_for_image(&config.image).min(config.scaleset_size);
    if per_scaleset == 0 {
        debug!(pool_name = %pool.name, "Autoscale scaleset size is zero, not creating scalesets");
        return Ok(());
    }

    let region = config
        .region
        .clone()
        .unwrap_or_else(|| ctx.config.base_region.clone());

    while needed > 0 {
        let size = needed.min(per_scaleset);
        let mut tags = BTreeMap::new();
        tags.insert("pool".to_string(), pool.name.clone());

        Scaleset::create(
            ctx,
            NewScaleset {
                pool_name: pool.name.clone(),
                vm_sku: config.vm_sku.clone(),
                image: config.image.clone(),
                region: region.clone(),
                size,
                spot_instances: config.spot_instances,
                ephemeral_os_disks: config.ephemeral_os_disks,
                tags,
            },
        )
        .await?;
        needed -= size;
    }
    Ok(())
}

async fn scale_down(
    ctx: &OrchestratorContext,
    pool: &Pool,
    scalesets: Vec<Scaleset>,
    mut to_remove: u32,
) -> Result<()> {
    info!(pool_name = %pool.name, to_remove, "Scaling down pool");

    for scaleset in scalesets {
        if to_remove == 0 {
            break;
        }

        let nodes = Node::search_states(ctx, Some(scaleset.scaleset_id), &[]).await?;
        let scaleset = if nodes.len() as u32 != scaleset.size
            && !matches!(
                scaleset.state,
                ScalesetState::Resize | ScalesetState::Shutdown | ScalesetState::Halt
            ) {
            scaleset.set_state(ctx, ScalesetState::Resize).await?
        } else {
            scaleset
        };

        let free: Vec<Node> = nodes
            .into_iter()
            .filter(|n| n.state == NodeState::Free && !n.delete_requested)
            .collect();
        if free.is_empty() {
            continue;
        }

        let removable = (free.len() as u32).min(to_remove);
        if removable >= scaleset.size && free.len() as u32 >= scaleset.size {
            info!(scaleset_id = %scaleset.scaleset_id, "Every node is free, shutting scaleset down");
            to_remove = to_remove.saturating_sub(scaleset.size);
            scaleset.set_shutdown(ctx, false).await?;
            for node in free {
                node.set_shutdown(ctx).await?;
            }
            continue;
        }

        let new_size = scaleset.size - removable;
        info!(scaleset_id = %scaleset.scaleset_id, size = new_size, "Shrinking scaleset");
        scaleset.set_size(ctx, new_size).await?;
        to_remove -= removable;
    }
    Ok(())
}

/// Bring the pool's scaleset capacity in line with its tasks.
pub async fn autoscale_pool(ctx: &OrchestratorContext, pool: &Pool) -> Result<()> {
    let Some(config) = &pool.autoscale else {
        return Ok(());
    };

    let scalesets = Scaleset::search_by_pool(ctx, &pool.name).await?;
    if scalesets.iter().any(|s| s.state.modifying()) {
        debug!(pool_name = %pool.name, "Scaleset modification in progress, skipping autoscale");
        return Ok(());
    }

    let requested: u32 = Task::get_tasks_by_pool_name(ctx, &pool.name)
        .await?
        .iter()
        .map(task_count)
        .sum();
    let target = target_size(requested, config);

    let current: u32 = scalesets
        .iter()
        .filter(|s| counts_toward_capacity(s.state))
        .map(|s| s.size)
        .sum();

    debug!(pool_name = %pool.name, requested, target, current, "Autoscale evaluation");

    if target > current {
        scale_up(ctx, pool, config, scalesets, target - current).await
    } else if current > target {
        scale_down(ctx, pool, scalesets, current - target).await
    } else {
        Ok(())
    }
}
