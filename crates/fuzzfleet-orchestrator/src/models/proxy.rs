// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-region TCP proxies and their port forwards.

use chrono::{DateTime, Utc};
use fuzzfleet_store::{Entity, EntityMeta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::{Authentication, ErrorInfo};
use crate::states::VmState;

/// VM size used for proxies.
pub const PROXY_SKU: &str = "Standard_B2s";

/// Image used for proxies.
pub const PROXY_IMAGE: &str = "Canonical:UbuntuServer:18.04-LTS:latest";

/// A proxy VM. There is at most one per region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    /// Region served.
    pub region: String,
    /// Current lifecycle state.
    pub state: VmState,
    /// VM credentials.
    pub auth: Authentication,
    /// Public address once known.
    #[serde(default)]
    pub ip: Option<String>,
    /// Why the proxy failed.
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    /// Service version the proxy was deployed with.
    pub version: String,
    /// Last heartbeat from the proxy agent.
    #[serde(default)]
    pub heartbeat: Option<DateTime<Utc>>,
    /// Deployed with an older service version; replace once unused.
    #[serde(default)]
    pub outdated: bool,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    meta: EntityMeta,
}

impl Proxy {
    /// A fresh proxy in the `init` state.
    pub fn new(region: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            state: VmState::Init,
            auth: Authentication::generate(),
            ip: None,
            error: None,
            version: version.into(),
            heartbeat: None,
            outdated: false,
            created_at: Utc::now(),
            meta: EntityMeta::default(),
        }
    }

    /// Name of the proxy's VM.
    pub fn vm_name(&self) -> String {
        format!("proxy-{}", self.region)
    }
}

impl Entity for Proxy {
    const TABLE: &'static str = "Proxy";

    fn partition_key(&self) -> String {
        self.region.clone()
    }

    fn row_key(&self) -> String {
        self.region.clone()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// A port on a region's proxy forwarded to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyForward {
    /// Region of the proxy.
    pub region: String,
    /// Port on the proxy.
    pub port: u16,
    /// Scaleset of the target node.
    pub scaleset_id: Uuid,
    /// Target node.
    pub machine_id: Uuid,
    /// Target address.
    pub dst_ip: String,
    /// Target port.
    pub dst_port: u16,
    /// Forward expiry.
    pub end_time: DateTime<Utc>,
    #[serde(skip)]
    meta: EntityMeta,
}

impl ProxyForward {
    /// Create a forward record.
    pub fn new(
        region: impl Into<String>,
        port: u16,
        scaleset_id: Uuid,
        machine_id: Uuid,
        dst_ip: impl Into<String>,
        dst_port: u16,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            region: region.into(),
            port,
            scaleset_id,
            machine_id,
            dst_ip: dst_ip.into(),
            dst_port,
            end_time,
            meta: EntityMeta::default(),
        }
    }
}

impl Entity for ProxyForward {
    const TABLE: &'static str = "ProxyForward";

    fn partition_key(&self) -> String {
        self.region.clone()
    }

    fn row_key(&self) -> String {
        self.port.to_string()
    }

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
