// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VM scalesets backing managed pools.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fuzzfleet_store::{Entity, EntityMeta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{Authentication, ErrorInfo};
use crate::states::{NodeState, ScalesetState};

/// Placement group limit for shared gallery images (ids starting with `/`).
pub const MAX_SIZE_SHARED_IMAGE: u32 = 600;

/// Placement group limit for marketplace images.
pub const MAX_SIZE_MARKETPLACE_IMAGE: u32 = 1000;

/// Largest scaleset the cloud accepts for `image`.
pub fn max_size_for_image(image: &str) -> u32 {
    if image.starts_with('/') {
        MAX_SIZE_SHARED_IMAGE
    } else {
        MAX_SIZE_MARKETPLACE_IMAGE
    }
}

/// One cloud instance joined with the node record for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalesetNodeState {
    /// Node machine id.
    pub machine_id: Uuid,
    /// Cloud instance id.
    pub instance_id: String,
    /// Node state, if the node has a record.
    #[serde(default)]
    pub state: Option<NodeState>,
}

/// A cloud VM scaleset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaleset {
    /// Owning pool.
    pub pool_name: String,
    /// Scaleset id, also the cloud resource name.
    pub scaleset_id: Uuid,
    /// Current lifecycle state.
    pub state: ScalesetState,
    /// VM credentials.
    #[serde(default)]
    pub auth: Option<Authentication>,
    /// VM size.
    pub vm_sku: String,
    /// Image.
    pub image: String,
    /// Region.
    pub region: String,
    /// Desired instance count.
    pub size: u32,
    /// Use spot instances.
    #[serde(default)]
    pub spot_instances: bool,
    /// Use ephemeral OS disks.
    #[serde(default = "default_true")]
    pub ephemeral_os_disks: bool,
    /// Extensions must be pushed to the cloud resource.
    #[serde(default)]
    pub needs_config_update: bool,
    /// Why creation failed.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    /// Managed identity client id.
    #[serde(default)]
    pub client_id: Option<Uuid>,
    /// Managed identity object id.
    #[serde(default)]
    pub client_object_id: Option<Uuid>,
    /// Resource tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Instance view, filled on demand.
    #[serde(skip)]
    pub nodes: Vec<ScalesetNodeState>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    meta: EntityMeta,
}

fn default_true() -> bool {
    true
}

/// Parameters of a new scaleset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewScaleset {
    /// Owning pool.
    pub pool_name: String,
    /// VM size.
    pub vm_sku: String,
    /// Image.
    pub image: String,
    /// Region.
    pub region: String,
    /// Requested instance count, clamped on creation.
    pub size: u32,
    /// Use spot instances.
    pub spot_instances: bool,
    /// Use ephemeral OS disks.
    pub ephemeral_os_disks: bool,
    /// Resource tags.
    pub tags: BTreeMap<String, String>,
}

impl Scaleset {
    /// A fresh scaleset in the `init` state with generated credentials.
    pub fn new(params: NewScaleset) -> Self {
        let size = params.size.min(max_size_for_image(&params.image));
        Self {
            pool_name: params.pool_name,
            scaleset_id: Uuid::new_v4(),
            state: ScalesetState::Init,
            auth: Some(Authentication::generate()),
            vm_sku: params.vm_sku,
            image: params.image,
            region: params.region,
            size,
            spot_instances: params.spot_instances,
            ephemeral_os_disks: params.ephemeral_os_disks,
            needs_config_update: false,
            error: None,
            client_id: None,
            client_object_id: None,
            tags: params.tags,
            nodes: Vec::new(),
            created_at: Utc::now(),
            meta: EntityMeta::default(),
        }
    }

    /// Largest size the cloud accepts for this scaleset's image.
    pub fn max_size(&self) -> u32 {
        max_size_for_image(&self.image)
    }
}

impl Entity for Scaleset {
    const TABLE: &'static str = "Scaleset";

    fn partition_key(&self) -> String {
        self.pool_name.clone()
    }

    fn row_key(&self) -> String {
        self.scaleset_id.to_string()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
