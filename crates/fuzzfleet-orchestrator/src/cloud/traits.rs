// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cloud capability interfaces.
//!
//! The orchestrator never talks to a cloud SDK directly. Every side effect on
//! VMs, scalesets, autoscale profiles and networks goes through these traits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Authentication, Os, Pool, Scaleset};

/// Errors from cloud operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CloudError {
    /// The resource is in the middle of another operation. Retry next pass.
    #[error("Resource is busy with another operation: {0}")]
    UnableToUpdate(String),

    /// The resource does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The cloud rejected the call.
    #[error("Cloud call failed ({code}): {message}")]
    Failed {
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },
}

impl CloudError {
    /// True when the call should simply be retried on the next pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::UnableToUpdate(_))
    }
}

/// Result type for cloud operations.
pub type Result<T> = std::result::Result<T, CloudError>;

/// Provisioning state reported for a cloud resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningState {
    /// Still being created or updated.
    Creating,
    /// Ready.
    Succeeded,
    /// Provisioning failed.
    Failed,
    /// Being deleted.
    Deleting,
}

/// A VM extension to install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmExtension {
    /// Extension name.
    pub name: String,
    /// Extension publisher.
    pub publisher: String,
    /// Extension settings.
    pub settings: serde_json::Value,
}

/// Everything needed to create a VM scaleset.
#[derive(Debug, Clone)]
pub struct VmssSpec {
    /// Region.
    pub region: String,
    /// Scaleset id, used as resource name.
    pub scaleset_id: Uuid,
    /// VM size.
    pub vm_sku: String,
    /// Instance count.
    pub count: u32,
    /// Image.
    pub image: String,
    /// Subnet the instances join.
    pub network_id: String,
    /// Use spot instances.
    pub spot_instances: bool,
    /// Use ephemeral OS disks.
    pub ephemeral_os_disks: bool,
    /// Extensions to install on every instance.
    pub extensions: Vec<VmExtension>,
    /// VM credentials.
    pub auth: Authentication,
    /// Resource tags.
    pub tags: BTreeMap<String, String>,
}

/// State of an existing scaleset resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmssInfo {
    /// Provisioning state.
    pub provisioning_state: ProvisioningState,
    /// Managed identity, once assigned.
    pub principal_id: Option<Uuid>,
}

/// VM scaleset operations.
#[async_trait]
pub trait VmssProvider: Send + Sync {
    /// Create the scaleset resource.
    async fn create_vmss(&self, spec: VmssSpec) -> Result<()>;

    /// Describe the scaleset, `None` if it does not exist.
    async fn get_vmss(&self, scaleset_id: Uuid) -> Result<Option<VmssInfo>>;

    /// Current instance count, `None` if the scaleset does not exist.
    async fn get_vmss_size(&self, scaleset_id: Uuid) -> Result<Option<u32>>;

    /// Change the instance count.
    async fn resize_vmss(&self, scaleset_id: Uuid, count: u32) -> Result<()>;

    /// Request deletion. Returns `true` once the resource is gone.
    async fn delete_vmss(&self, scaleset_id: Uuid) -> Result<bool>;

    /// Instances keyed by machine id, valued by instance id.
    async fn list_instance_ids(&self, scaleset_id: Uuid) -> Result<HashMap<Uuid, String>>;

    /// Private IP address of an instance.
    async fn get_instance_ip(&self, scaleset_id: Uuid, machine_id: Uuid) -> Result<Option<String>>;

    /// Reimage instances.
    async fn reimage_nodes(&self, scaleset_id: Uuid, machine_ids: &[Uuid]) -> Result<()>;

    /// Delete instances.
    async fn delete_nodes(&self, scaleset_id: Uuid, machine_ids: &[Uuid]) -> Result<()>;

    /// Replace the extension set on every instance.
    async fn update_extensions(&self, scaleset_id: Uuid, extensions: Vec<VmExtension>)
    -> Result<()>;

    /// Set or clear scale-in protection on one instance.
    async fn update_scale_in_protection(
        &self,
        scaleset_id: Uuid,
        machine_id: Uuid,
        protect: bool,
    ) -> Result<()>;

    /// Machine ids still holding scale-in protection.
    async fn list_protected_instances(&self, scaleset_id: Uuid) -> Result<Vec<Uuid>>;

    /// Operating system of an image, `None` if the image is unknown.
    async fn get_image_os(&self, region: &str, image: &str) -> Result<Option<Os>>;
}

/// Direction of an autoscale rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleDirection {
    /// Add instances.
    Increase,
    /// Remove instances.
    Decrease,
}

/// A single autoscale rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRule {
    /// Direction.
    pub direction: ScaleDirection,
    /// Instances changed per trigger.
    pub change_count: u32,
    /// Cooldown between triggers.
    pub cooldown_minutes: u32,
}

/// Autoscale profile of a scaleset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscaleProfile {
    /// Minimum capacity.
    pub minimum: u32,
    /// Maximum capacity.
    pub maximum: u32,
    /// Default capacity.
    pub default: u32,
    /// Rules.
    pub rules: Vec<ScaleRule>,
}

impl AutoscaleProfile {
    /// The profile installed on a freshly created scaleset.
    pub fn default_for(size: u32, max_size: u32) -> Self {
        Self {
            minimum: size,
            maximum: max_size,
            default: size,
            rules: vec![
                ScaleRule {
                    direction: ScaleDirection::Increase,
                    change_count: 1,
                    cooldown_minutes: 10,
                },
                ScaleRule {
                    direction: ScaleDirection::Decrease,
                    change_count: 1,
                    cooldown_minutes: 15,
                },
            ],
        }
    }

    /// A profile that can only remove instances, never below `protected`.
    pub fn scale_in_only(protected: u32, maximum: u32) -> Self {
        Self {
            minimum: protected,
            maximum: maximum.max(protected),
            default: protected,
            rules: vec![ScaleRule {
                direction: ScaleDirection::Decrease,
                change_count: 1,
                cooldown_minutes: 5,
            }],
        }
    }
}

/// Autoscale profile operations.
#[async_trait]
pub trait AutoscaleProvider: Send + Sync {
    /// Current profile, `None` if autoscale is not configured.
    async fn get_autoscale_profile(&self, scaleset_id: Uuid) -> Result<Option<AutoscaleProfile>>;

    /// Install or replace the profile.
    async fn create_or_update_autoscale_profile(
        &self,
        scaleset_id: Uuid,
        profile: AutoscaleProfile,
    ) -> Result<()>;
}

/// Virtual network operations.
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Subnet id for a region, `None` if the network does not exist yet.
    async fn get_network_id(&self, region: &str) -> Result<Option<String>>;

    /// Create the region's network.
    async fn create_network(&self, region: &str) -> Result<()>;
}

/// Everything needed to create a single VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    /// VM name.
    pub name: String,
    /// Region.
    pub region: String,
    /// VM size.
    pub sku: String,
    /// Image.
    pub image: String,
    /// Credentials.
    pub auth: Authentication,
}

/// State of an existing VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    /// Provisioning state.
    pub provisioning_state: ProvisioningState,
    /// Public address, once assigned.
    pub ip: Option<String>,
    /// Error statuses reported by the cloud.
    pub errors: Vec<String>,
}

/// Single VM operations used by proxies and repro VMs.
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Describe a VM, `None` if it does not exist.
    async fn get_vm(&self, name: &str) -> Result<Option<VmInfo>>;

    /// Create a VM.
    async fn create_vm(&self, spec: VmSpec) -> Result<()>;

    /// Install extensions. Returns `true` once they are all provisioned.
    async fn add_extensions(&self, name: &str, extensions: Vec<VmExtension>) -> Result<bool>;

    /// Request deletion.
    async fn delete_vm(&self, name: &str) -> Result<()>;

    /// True once the VM and its resources are gone.
    async fn is_deleted(&self, name: &str) -> Result<bool>;
}

/// The set of cloud capabilities the orchestrator needs.
#[derive(Clone)]
pub struct CloudProviders {
    /// Scalesets.
    pub vmss: Arc<dyn VmssProvider>,
    /// Autoscale profiles.
    pub autoscale: Arc<dyn AutoscaleProvider>,
    /// Networks.
    pub network: Arc<dyn NetworkProvider>,
    /// Single VMs.
    pub vm: Arc<dyn VmProvider>,
}

impl CloudProviders {
    /// Use one object implementing every capability.
    pub fn from_single<P>(provider: Arc<P>) -> Self
    where
        P: VmssProvider + AutoscaleProvider + NetworkProvider + VmProvider + 'static,
    {
        Self {
            vmss: provider.clone(),
            autoscale: provider.clone(),
            network: provider.clone(),
            vm: provider,
        }
    }
}

/// Extension set installed on the nodes of a scaleset.
pub fn fuzz_extensions(pool: &Pool, scaleset: &Scaleset) -> Vec<VmExtension> {
    let agent = match pool.os {
        Os::Linux => ("fuzzfleet-agent-linux", "CustomScript"),
        Os::Windows => ("fuzzfleet-agent-windows", "CustomScriptExtension"),
    };
    vec![
        VmExtension {
            name: agent.0.to_string(),
            publisher: agent.1.to_string(),
            settings: serde_json::json!({
                "pool_name": pool.name,
                "scaleset_id": scaleset.scaleset_id,
                "region": scaleset.region,
            }),
        },
        VmExtension {
            name: "monitoring".to_string(),
            publisher: "AzureMonitor".to_string(),
            settings: serde_json::json!({ "region": scaleset.region }),
        },
    ]
}

/// Extension set installed on a proxy or repro VM.
pub fn vm_extensions(region: &str, role: &str) -> Vec<VmExtension> {
    vec![VmExtension {
        name: format!("fuzzfleet-{role}"),
        publisher: "CustomScript".to_string(),
        settings: serde_json::json!({ "region": region }),
    }]
}
