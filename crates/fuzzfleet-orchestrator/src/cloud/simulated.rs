// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process cloud for tests and local runs.
//!
//! Keeps scalesets, instances, autoscale profiles, networks and VMs in memory
//! and exposes a few knobs to simulate drift and busy resources.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::traits::*;
use crate::models::Os;

#[derive(Debug, Clone)]
struct SimVmss {
    capacity: u32,
    provisioning_state: ProvisioningState,
    principal_id: Option<Uuid>,
    instances: BTreeMap<Uuid, String>,
    protected: HashSet<Uuid>,
    extensions: Vec<VmExtension>,
    next_instance: u64,
}

impl SimVmss {
    fn add_instance(&mut self) {
        let instance_id = self.next_instance.to_string();
        self.next_instance += 1;
        self.instances.insert(Uuid::new_v4(), instance_id);
    }
}

#[derive(Debug, Clone)]
struct SimVm {
    provisioning_state: ProvisioningState,
    ip: Option<String>,
    errors: Vec<String>,
    extensions: Vec<VmExtension>,
    deleting: bool,
}

#[derive(Debug, Default)]
struct SimState {
    vmss: HashMap<Uuid, SimVmss>,
    autoscale: HashMap<Uuid, AutoscaleProfile>,
    networks: HashSet<String>,
    vms: HashMap<String, SimVm>,
    busy: HashSet<Uuid>,
    pending_delete: HashSet<Uuid>,
    fail_create: Option<String>,
    image_os: HashMap<String, Os>,
    reimaged: Vec<Uuid>,
    deleted: Vec<Uuid>,
}

/// Simulated cloud implementing every provider trait.
#[derive(Clone, Default)]
pub struct SimulatedCloud {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCloud {
    /// Create an empty cloud.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap this cloud as a provider set.
    pub fn providers(&self) -> CloudProviders {
        CloudProviders::from_single(Arc::new(self.clone()))
    }

    /// Replace the instances of a scaleset without touching its capacity.
    pub async fn set_instances(&self, scaleset_id: Uuid, machine_ids: &[Uuid]) {
        let mut state = self.state.lock().await;
        if let Some(vmss) = state.vmss.get_mut(&scaleset_id) {
            vmss.instances = machine_ids
                .iter()
                .enumerate()
                .map(|(i, id)| (*id, i.to_string()))
                .collect();
            vmss.protected.retain(|id| machine_ids.contains(id));
            vmss.next_instance = machine_ids.len() as u64;
        }
    }

    /// Current instance machine ids of a scaleset.
    pub async fn instances(&self, scaleset_id: Uuid) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state
            .vmss
            .get(&scaleset_id)
            .map(|v| v.instances.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Set the capacity reported for a scaleset.
    pub async fn set_capacity(&self, scaleset_id: Uuid, capacity: u32) {
        let mut state = self.state.lock().await;
        if let Some(vmss) = state.vmss.get_mut(&scaleset_id) {
            vmss.capacity = capacity;
        }
    }

    /// Override the provisioning state of a scaleset.
    pub async fn set_vmss_provisioning(&self, scaleset_id: Uuid, provisioning: ProvisioningState) {
        let mut state = self.state.lock().await;
        if let Some(vmss) = state.vmss.get_mut(&scaleset_id) {
            vmss.provisioning_state = provisioning;
        }
    }

    /// Make mutating calls on a scaleset fail as "operation in progress".
    pub async fn set_busy(&self, scaleset_id: Uuid, busy: bool) {
        let mut state = self.state.lock().await;
        if busy {
            state.busy.insert(scaleset_id);
        } else {
            state.busy.remove(&scaleset_id);
        }
    }

    /// Keep a scaleset deletion pending until cleared.
    pub async fn set_delete_pending(&self, scaleset_id: Uuid, pending: bool) {
        let mut state = self.state.lock().await;
        if pending {
            state.pending_delete.insert(scaleset_id);
        } else {
            state.pending_delete.remove(&scaleset_id);
        }
    }

    /// Fail the next scaleset or VM creation with `message`.
    pub async fn fail_next_create(&self, message: impl Into<String>) {
        self.state.lock().await.fail_create = Some(message.into());
    }

    /// Report `os` for `image`.
    pub async fn set_image_os(&self, image: impl Into<String>, os: Os) {
        self.state.lock().await.image_os.insert(image.into(), os);
    }

    /// Machine ids passed to `reimage_nodes`, in call order.
    pub async fn reimaged_nodes(&self) -> Vec<Uuid> {
        self.state.lock().await.reimaged.clone()
    }

    /// Machine ids passed to `delete_nodes`, in call order.
    pub async fn deleted_nodes(&self) -> Vec<Uuid> {
        self.state.lock().await.deleted.clone()
    }

    /// Machine ids holding scale-in protection.
    pub async fn protected(&self, scaleset_id: Uuid) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state
            .vmss
            .get(&scaleset_id)
            .map(|v| v.protected.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Current autoscale profile.
    pub async fn autoscale_profile(&self, scaleset_id: Uuid) -> Option<AutoscaleProfile> {
        self.state.lock().await.autoscale.get(&scaleset_id).cloned()
    }

    /// True while the scaleset resource exists.
    pub async fn vmss_exists(&self, scaleset_id: Uuid) -> bool {
        self.state.lock().await.vmss.contains_key(&scaleset_id)
    }

    /// True when the region's network exists.
    pub async fn network_exists(&self, region: &str) -> bool {
        self.state.lock().await.networks.contains(region)
    }

    /// Override the provisioning state of a VM, adding an error status.
    pub async fn set_vm_state(
        &self,
        name: &str,
        provisioning: ProvisioningState,
        error: Option<String>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(vm) = state.vms.get_mut(name) {
            vm.provisioning_state = provisioning;
            vm.errors.extend(error);
        }
    }

    /// True while a VM exists.
    pub async fn vm_exists(&self, name: &str) -> bool {
        self.state.lock().await.vms.contains_key(name)
    }

    /// Extensions currently configured on a scaleset.
    pub async fn vmss_extensions(&self, scaleset_id: Uuid) -> Vec<VmExtension> {
        let state = self.state.lock().await;
        state
            .vmss
            .get(&scaleset_id)
            .map(|v| v.extensions.clone())
            .unwrap_or_default()
    }

    /// Extensions installed on a VM.
    pub async fn vm_extensions(&self, name: &str) -> Vec<VmExtension> {
        let state = self.state.lock().await;
        state
            .vms
            .get(name)
            .map(|vm| vm.extensions.clone())
            .unwrap_or_default()
    }
}

fn busy(state: &SimState, scaleset_id: Uuid) -> Result<()> {
    if state.busy.contains(&scaleset_id) {
        return Err(CloudError::UnableToUpdate(format!(
            "scaleset {scaleset_id} has an operation in progress"
        )));
    }
    Ok(())
}

fn vmss_mut(state: &mut SimState, scaleset_id: Uuid) -> Result<&mut SimVmss> {
    state
        .vmss
        .get_mut(&scaleset_id)
        .ok_or_else(|| CloudError::NotFound(format!("scaleset {scaleset_id}")))
}

#[async_trait]
impl VmssProvider for SimulatedCloud {
    async fn create_vmss(&self, spec: VmssSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.fail_create.take() {
            return Err(CloudError::Failed {
                code: "VmCreateFailed".to_string(),
                message,
            });
        }
        if state.vmss.contains_key(&spec.scaleset_id) {
            return Err(CloudError::Failed {
                code: "Conflict".to_string(),
                message: format!("scaleset {} already exists", spec.scaleset_id),
            });
        }
        let mut vmss = SimVmss {
            capacity: spec.count,
            provisioning_state: ProvisioningState::Succeeded,
            principal_id: Some(Uuid::new_v4()),
            instances: BTreeMap::new(),
            protected: HashSet::new(),
            extensions: spec.extensions,
            next_instance: 0,
        };
        for _ in 0..spec.count {
            vmss.add_instance();
        }
        state.vmss.insert(spec.scaleset_id, vmss);
        Ok(())
    }

    async fn get_vmss(&self, scaleset_id: Uuid) -> Result<Option<VmssInfo>> {
        let state = self.state.lock().await;
        Ok(state.vmss.get(&scaleset_id).map(|v| VmssInfo {
            provisioning_state: v.provisioning_state,
            principal_id: v.principal_id,
        }))
    }

    async fn get_vmss_size(&self, scaleset_id: Uuid) -> Result<Option<u32>> {
        let state = self.state.lock().await;
        Ok(state.vmss.get(&scaleset_id).map(|v| v.capacity))
    }

    async fn resize_vmss(&self, scaleset_id: Uuid, count: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        busy(&state, scaleset_id)?;
        let vmss = vmss_mut(&mut state, scaleset_id)?;
        vmss.capacity = count;
        while (vmss.instances.len() as u32) < count {
            vmss.add_instance();
        }
        while (vmss.instances.len() as u32) > count {
            let Some(id) = vmss.instances.keys().next_back().copied() else {
                break;
            };
            vmss.instances.remove(&id);
            vmss.protected.remove(&id);
        }
        Ok(())
    }

    async fn delete_vmss(&self, scaleset_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.pending_delete.contains(&scaleset_id) {
            return Ok(false);
        }
        state.vmss.remove(&scaleset_id);
        state.autoscale.remove(&scaleset_id);
        Ok(true)
    }

    async fn list_instance_ids(&self, scaleset_id: Uuid) -> Result<HashMap<Uuid, String>> {
        let state = self.state.lock().await;
        Ok(state
            .vmss
            .get(&scaleset_id)
            .map(|v| v.instances.clone().into_iter().collect())
            .unwrap_or_default())
    }

    async fn get_instance_ip(&self, scaleset_id: Uuid, machine_id: Uuid) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .vmss
            .get(&scaleset_id)
            .and_then(|v| v.instances.get(&machine_id))
            .and_then(|instance| instance.parse::<u64>().ok())
            .map(|n| format!("10.0.{}.{}", (n / 250) % 256, n % 250 + 4)))
    }

    async fn reimage_nodes(&self, scaleset_id: Uuid, machine_ids: &[Uuid]) -> Result<()> {
        let mut state = self.state.lock().await;
        busy(&state, scaleset_id)?;
        vmss_mut(&mut state, scaleset_id)?;
        state.reimaged.extend_from_slice(machine_ids);
        Ok(())
    }

    async fn delete_nodes(&self, scaleset_id: Uuid, machine_ids: &[Uuid]) -> Result<()> {
        let mut state = self.state.lock().await;
        busy(&state, scaleset_id)?;
        let vmss = vmss_mut(&mut state, scaleset_id)?;
        for id in machine_ids {
            if vmss.instances.remove(id).is_some() {
                vmss.capacity = vmss.capacity.saturating_sub(1);
            }
            vmss.protected.remove(id);
        }
        state.deleted.extend_from_slice(machine_ids);
        Ok(())
    }

    async fn update_extensions(
        &self,
        scaleset_id: Uuid,
        extensions: Vec<VmExtension>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        busy(&state, scaleset_id)?;
        vmss_mut(&mut state, scaleset_id)?.extensions = extensions;
        Ok(())
    }

    async fn update_scale_in_protection(
        &self,
        scaleset_id: Uuid,
        machine_id: Uuid,
        protect: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        busy(&state, scaleset_id)?;
        let vmss = vmss_mut(&mut state, scaleset_id)?;
        if !vmss.instances.contains_key(&machine_id) {
            return Err(CloudError::NotFound(format!(
                "instance {machine_id} of scaleset {scaleset_id}"
            )));
        }
        if protect {
            vmss.protected.insert(machine_id);
        } else {
            vmss.protected.remove(&machine_id);
        }
        Ok(())
    }

    async fn list_protected_instances(&self, scaleset_id: Uuid) -> Result<Vec<Uuid>> {
        let state = self.state.lock().await;
        Ok(state
            .vmss
            .get(&scaleset_id)
            .map(|v| v.protected.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get_image_os(&self, _region: &str, image: &str) -> Result<Option<Os>> {
        let state = self.state.lock().await;
        if let Some(os) = state.image_os.get(image) {
            return Ok(Some(*os));
        }
        if image.to_ascii_lowercase().contains("windows") {
            Ok(Some(Os::Windows))
        } else {
            Ok(Some(Os::Linux))
        }
    }
}

#[async_trait]
impl AutoscaleProvider for SimulatedCloud {
    async fn get_autoscale_profile(&self, scaleset_id: Uuid) -> Result<Option<AutoscaleProfile>> {
        Ok(self.state.lock().await.autoscale.get(&scaleset_id).cloned())
    }

    async fn create_or_update_autoscale_profile(
        &self,
        scaleset_id: Uuid,
        profile: AutoscaleProfile,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        vmss_mut(&mut state, scaleset_id)?;
        state.autoscale.insert(scaleset_id, profile);
        Ok(())
    }
}

#[async_trait]
impl NetworkProvider for SimulatedCloud {
    async fn get_network_id(&self, region: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .networks
            .contains(region)
            .then(|| format!("/networks/{region}/subnets/fuzzfleet")))
    }

    async fn create_network(&self, region: &str) -> Result<()> {
        self.state.lock().await.networks.insert(region.to_string());
        Ok(())
    }
}

#[async_trait]
impl VmProvider for SimulatedCloud {
    async fn get_vm(&self, name: &str) -> Result<Option<VmInfo>> {
        let state = self.state.lock().await;
        Ok(state.vms.get(name).map(|vm| VmInfo {
            provisioning_state: vm.provisioning_state,
            ip: vm.ip.clone(),
            errors: vm.errors.clone(),
        }))
    }

    async fn create_vm(&self, spec: VmSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.fail_create.take() {
            return Err(CloudError::Failed {
                code: "VmCreateFailed".to_string(),
                message,
            });
        }
        let octet = state.vms.len() % 250 + 4;
        state.vms.insert(
            spec.name,
            SimVm {
                provisioning_state: ProvisioningState::Succeeded,
                ip: Some(format!("10.0.0.{octet}")),
                errors: Vec::new(),
                extensions: Vec::new(),
                deleting: false,
            },
        );
        Ok(())
    }

    async fn add_extensions(&self, name: &str, extensions: Vec<VmExtension>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let vm = state
            .vms
            .get_mut(name)
            .ok_or_else(|| CloudError::NotFound(format!("vm {name}")))?;
        vm.extensions = extensions;
        Ok(true)
    }

    async fn delete_vm(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.vms.get_mut(name) {
            // deletion completes on the next observation
            Some(vm) if !vm.deleting => vm.deleting = true,
            Some(_) => {
                state.vms.remove(name);
            }
            None => {}
        }
        Ok(())
    }

    async fn is_deleted(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.vms.get(name) {
            None => Ok(true),
            Some(vm) if vm.deleting => {
                state.vms.remove(name);
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Authentication;

    fn spec(id: Uuid, count: u32) -> VmssSpec {
        VmssSpec {
            region: "eastus".into(),
            scaleset_id: id,
            vm_sku: "Standard_D2s_v3".into(),
            count,
            image: "Canonical:UbuntuServer:18.04-LTS:latest".into(),
            network_id: "/networks/eastus/subnets/fuzzfleet".into(),
            spot_instances: false,
            ephemeral_os_disks: true,
            extensions: Vec::new(),
            auth: Authentication::generate(),
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_resize_adds_and_removes_instances() {
        let cloud = SimulatedCloud::new();
        let id = Uuid::new_v4();
        cloud.create_vmss(spec(id, 2)).await.unwrap();
        assert_eq!(cloud.list_instance_ids(id).await.unwrap().len(), 2);

        cloud.resize_vmss(id, 5).await.unwrap();
        assert_eq!(cloud.get_vmss_size(id).await.unwrap(), Some(5));
        assert_eq!(cloud.instances(id).await.len(), 5);

        cloud.resize_vmss(id, 1).await.unwrap();
        assert_eq!(cloud.instances(id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_busy_scaleset_rejects_updates() {
        let cloud = SimulatedCloud::new();
        let id = Uuid::new_v4();
        cloud.create_vmss(spec(id, 1)).await.unwrap();
        cloud.set_busy(id, true).await;
        let err = cloud.resize_vmss(id, 3).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_vm_delete_completes_on_next_check() {
        let cloud = SimulatedCloud::new();
        cloud
            .create_vm(VmSpec {
                name: "proxy-eastus".into(),
                region: "eastus".into(),
                sku: "Standard_B2s".into(),
                image: "img".into(),
                auth: Authentication::generate(),
            })
            .await
            .unwrap();
        assert!(!cloud.is_deleted("proxy-eastus").await.unwrap());
        cloud.delete_vm("proxy-eastus").await.unwrap();
        assert!(cloud.is_deleted("proxy-eastus").await.unwrap());
        assert!(!cloud.vm_exists("proxy-eastus").await);
    }
}
