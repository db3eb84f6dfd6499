// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pools group nodes and scalesets sharing an OS and architecture.

use chrono::{DateTime, Utc};
use fuzzfleet_store::{Entity, EntityMeta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{Architecture, Os};
use crate::states::PoolState;

/// Autoscale settings of a managed pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoScaleConfig {
    /// Image for new scalesets.
    pub image: String,
    /// Upper bound on nodes.
    #[serde(default)]
    pub max_size: Option<u32>,
    /// Lower bound on nodes.
    #[serde(default)]
    pub min_size: u32,
    /// Region for new scalesets.
    #[serde(default)]
    pub region: Option<String>,
    /// Size of each new scaleset.
    pub scaleset_size: u32,
    /// Use spot instances.
    #[serde(default)]
    pub spot_instances: bool,
    /// Use ephemeral OS disks.
    #[serde(default = "default_true")]
    pub ephemeral_os_disks: bool,
    /// VM size.
    pub vm_sku: String,
}

fn default_true() -> bool {
    true
}

/// A named group of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    /// Unique name.
    pub name: String,
    /// Pool id.
    pub pool_id: Uuid,
    /// Operating system of every node.
    pub os: Os,
    /// CPU architecture of every node.
    pub arch: Architecture,
    /// Nodes are provisioned through scalesets.
    pub managed: bool,
    /// Current lifecycle state.
    pub state: PoolState,
    /// Identity used by the pool's nodes.
    #[serde(default)]
    pub client_id: Option<Uuid>,
    /// Autoscale settings.
    #[serde(default)]
    pub autoscale: Option<AutoScaleConfig>,
    /// When the pool was created.
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    meta: EntityMeta,
}

impl Pool {
    /// A fresh pool in the `init` state.
    pub fn new(
        name: impl Into<String>,
        os: Os,
        arch: Architecture,
        managed: bool,
        client_id: Option<Uuid>,
        autoscale: Option<AutoScaleConfig>,
    ) -> Self {
        Self {
            name: name.into(),
            pool_id: Uuid::new_v4(),
            os,
            arch,
            managed,
            state: PoolState::Init,
            client_id,
            autoscale,
            created_at: Utc::now(),
            meta: EntityMeta::default(),
        }
    }

    /// Name of the queue work sets for this pool are posted to.
    pub fn work_queue_name(&self) -> String {
        format!("pool-{}", self.pool_id.simple())
    }
}

impl Entity for Pool {
    const TABLE: &'static str = "Pool";

    fn partition_key(&self) -> String {
        self.name.clone()
    }

    fn row_key(&self) -> String {
        self.pool_id.to_string()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
