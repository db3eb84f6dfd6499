// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash reproduction VMs.

use chrono::{DateTime, Utc};
use fuzzfleet_store::{Entity, EntityMeta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{Authentication, ErrorInfo, Os, UserInfo};
use crate::states::VmState;

/// VM size used when the task does not name one.
pub const DEFAULT_REPRO_SKU: &str = "Standard_DS1_v2";

/// Image used when the task does not name one.
pub fn default_repro_image(os: Os) -> &'static str {
    match os {
        Os::Linux => "Canonical:UbuntuServer:18.04-LTS:latest",
        Os::Windows => "MicrosoftWindowsDesktop:Windows-10:20h2-pro:latest",
    }
}

/// What to reproduce and for how long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReproConfig {
    /// Container holding the crash report.
    pub container: String,
    /// Path of the report within the container.
    pub path: String,
    /// Lifetime in hours.
    pub duration: u64,
}

/// A debugging VM for one crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repro {
    /// VM id.
    pub vm_id: Uuid,
    /// Task the crash came from.
    pub task_id: Uuid,
    /// Configuration.
    pub config: ReproConfig,
    /// Current lifecycle state.
    pub state: VmState,
    /// Operating system.
    pub os: Os,
    /// VM credentials.
    #[serde(default)]
    pub auth: Option<Authentication>,
    /// Public address once known.
    #[serde(default)]
    pub ip: Option<String>,
    /// Expiry.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Why the VM failed.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    /// Requesting user.
    #[serde(default)]
    pub user_info: Option<UserInfo>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    meta: EntityMeta,
}

impl Repro {
    /// A fresh repro VM in the `init` state.
    pub fn new(task_id: Uuid, os: Os, config: ReproConfig, user_info: Option<UserInfo>) -> Self {
        Self {
            vm_id: Uuid::new_v4(),
            task_id,
            config,
            state: VmState::Init,
            os,
            auth: Some(Authentication::generate()),
            ip: None,
            end_time: None,
            error: None,
            user_info,
            created_at: Utc::now(),
            meta: EntityMeta::default(),
        }
    }
}

impl Entity for Repro {
    const TABLE: &'static str = "Repro";

    fn partition_key(&self) -> String {
        self.vm_id.to_string()
    }

    fn row_key(&self) -> String {
        self.vm_id.to_string()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
