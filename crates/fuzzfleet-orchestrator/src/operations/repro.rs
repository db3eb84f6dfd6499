// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash reproduction VMs.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fuzzfleet_store::QueryFilter;
use tracing::{error, info};
use uuid::Uuid;

use super::StateMachine;
use crate::cloud::{ProvisioningState, VmInfo, VmSpec, vm_extensions};
use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::models::repro::{DEFAULT_REPRO_SKU, default_repro_image};
use crate::models::{ErrorCode, ErrorInfo, Repro, ReproConfig, Task, TaskVm, UserInfo};
use crate::states::VmState;

impl Repro {
    /// Request a repro VM for a crash of `task_id`.
    pub async fn create(
        ctx: &OrchestratorContext,
        task_id: Uuid,
        config: ReproConfig,
        user_info: Option<UserInfo>,
    ) -> Result<Repro> {
        let Some(task) = Task::get_by_task_id(ctx, task_id).await? else {
            return Err(Error::UnableToFind(format!("unable to find task: {task_id}")));
        };

        let mut repro = Repro::new(task.task_id, task.os, config, user_info);
        repro.end_time = Some(Utc::now() + Duration::hours(repro.config.duration as i64));

        let repro = ctx.store.insert(repro).await?;
        info!(vm_id = %repro.vm_id, task_id = %repro.task_id, "Repro created");
        Ok(repro)
    }

    /// Load a repro.
    pub async fn get(ctx: &OrchestratorContext, vm_id: Uuid) -> Result<Option<Repro>> {
        let key = vm_id.to_string();
        Ok(ctx.store.get(&key, &key).await?)
    }

    /// Repros in any of `states` (or any state).
    pub async fn search_states(ctx: &OrchestratorContext, states: &[VmState]) -> Result<Vec<Repro>> {
        let mut filter = QueryFilter::new();
        if !states.is_empty() {
            filter = filter.field_in("state", states.iter().copied());
        }
        Ok(ctx.store.query(&filter).await?)
    }

    /// Available repros whose end time has passed.
    pub async fn search_expired(ctx: &OrchestratorContext) -> Result<Vec<Repro>> {
        let now = Utc::now();
        Ok(Self::search_states(ctx, VmState::AVAILABLE)
            .await?
            .into_iter()
            .filter(|repro| repro.end_time.is_some_and(|end| end < now))
            .collect())
    }

    /// Write the repro back.
    pub async fn save(self, ctx: &OrchestratorContext) -> Result<Repro> {
        Ok(ctx.store.replace(self).await?)
    }

    fn vm_name(&self) -> String {
        self.vm_id.to_string()
    }

    /// Record `error` and start tearing the VM down.
    pub async fn set_error(mut self, ctx: &OrchestratorContext, error: ErrorInfo) -> Result<Repro> {
        error!(vm_id = %self.vm_id, task_id = %self.task_id, error = %error, "Repro failed");
        self.error = Some(error);
        self.state = VmState::Stopping;
        self.save(ctx).await
    }

    /// Record a provisioning failure reported by the cloud.
    pub async fn set_failed(self, ctx: &OrchestratorContext, info: &VmInfo) -> Result<Repro> {
        let error = ErrorInfo {
            code: ErrorCode::VmCreateFailed,
            errors: info.errors.clone(),
        };
        self.set_error(ctx, error).await
    }

    /// Where to run the VM.
    ///
    /// The task's own VM settings, the first scaleset of its pool, or the
    /// defaults for its OS in the base region.
    async fn vm_spec(&self, ctx: &OrchestratorContext) -> Result<VmSpec> {
        let Some(task) = Task::get_by_task_id(ctx, self.task_id).await? else {
            return Err(Error::UnableToFind(format!(
                "previously existing task missing: {}",
                self.task_id
            )));
        };
        let Some(auth) = self.auth.clone() else {
            return Err(Error::VmCreateFailed("missing auth".to_string()));
        };

        let vm = match task.get_repro_vm_config(ctx).await? {
            Some(vm) => vm,
            None => TaskVm {
                region: ctx.config.base_region.clone(),
                sku: DEFAULT_REPRO_SKU.to_string(),
                image: default_repro_image(task.os).to_string(),
                count: 1,
                spot_instances: false,
                reboot_after_setup: None,
            },
        };

        Ok(VmSpec {
            name: self.vm_name(),
            region: vm.region,
            sku: vm.sku,
            image: vm.image,
            auth,
        })
    }

    /// Create the VM, or move on once it exists.
    pub async fn init(self, ctx: &OrchestratorContext) -> Result<Repro> {
        let spec = match self.vm_spec(ctx).await {
            Ok(spec) => spec,
            Err(e) => return self.set_error(ctx, e.to_info()).await,
        };

        match ctx.cloud.vm.get_vm(&spec.name).await? {
            Some(info) if info.provisioning_state == ProvisioningState::Failed => {
                self.set_failed(ctx, &info).await
            }
            Some(_) => {
                let mut repro = self;
                repro.state = VmState::ExtensionsLaunch;
                repro.save(ctx).await
            }
            None => {
                info!(vm_id = %self.vm_id, region = %spec.region, "Creating repro VM");
                match ctx.cloud.vm.create_vm(spec).await {
                    Ok(()) => self.save(ctx).await,
                    Err(e) => {
                        let error = ErrorInfo::new(ErrorCode::VmCreateFailed, e.to_string());
                        self.set_error(ctx, error).await
                    }
                }
            }
        }
    }

    /// Install the repro extensions once the VM is up.
    pub async fn extensions_launch(mut self, ctx: &OrchestratorContext) -> Result<Repro> {
        let Some(info) = ctx.cloud.vm.get_vm(&self.vm_name()).await? else {
            let error = ErrorInfo::new(ErrorCode::VmCreateFailed, "failed before launching extensions");
            return self.set_error(ctx, error).await;
        };

        if info.provisioning_state == ProvisioningState::Failed {
            return self.set_failed(ctx, &info).await;
        }

        if self.ip.is_none() {
            self.ip = info.ip;
        }

        let region = match self.vm_spec(ctx).await {
            Ok(spec) => spec.region,
            Err(e) => return self.set_error(ctx, e.to_info()).await,
        };
        match ctx
            .cloud
            .vm
            .add_extensions(&self.vm_name(), vm_extensions(&region, "repro"))
            .await
        {
            Ok(true) => {
                info!(vm_id = %self.vm_id, "Repro VM running");
                self.state = VmState::Running;
                self.save(ctx).await
            }
            Ok(false) => self.save(ctx).await,
            Err(e) => {
                let error = ErrorInfo::new(ErrorCode::VmCreateFailed, e.to_string());
                self.set_error(ctx, error).await
            }
        }
    }

    /// Delete the VM; the record goes once the VM is gone.
    pub async fn stopping(self, ctx: &OrchestratorContext) -> Result<Option<Repro>> {
        if ctx.cloud.vm.is_deleted(&self.vm_name()).await? {
            self.stopped(ctx).await?;
            return Ok(None);
        }

        info!(vm_id = %self.vm_id, "Repro VM stopping");
        ctx.cloud.vm.delete_vm(&self.vm_name()).await?;
        self.save(ctx).await.map(Some)
    }

    /// Remove the record.
    pub async fn stopped(self, ctx: &OrchestratorContext) -> Result<()> {
        info!(vm_id = %self.vm_id, "Repro VM stopped");
        ctx.store.delete(&self).await?;
        Ok(())
    }
}

#[async_trait]
impl StateMachine for Repro {
    type State = VmState;

    fn state(&self) -> VmState {
        self.state
    }

    fn needs_work(&self) -> bool {
        self.state.needs_work()
    }

    async fn process_state_update(self, ctx: &OrchestratorContext) -> Result<Option<Self>> {
        match self.state {
            VmState::Init => self.init(ctx).await.map(Some),
            VmState::ExtensionsLaunch => self.extensions_launch(ctx).await.map(Some),
            VmState::Stopping => self.stopping(ctx).await,
            _ => Ok(Some(self)),
        }
    }
}
