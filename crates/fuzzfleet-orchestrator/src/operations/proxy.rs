// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Region proxy VMs and their port forwards.
//!
//! There is at most one proxy per region. A proxy deployed by an older
//! service version is marked outdated and replaced once no forward uses it.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use fuzzfleet_store::QueryFilter;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::StateMachine;
use crate::cloud::{ProvisioningState, VmInfo, VmSpec, vm_extensions};
use crate::context::OrchestratorContext;
use crate::error::{Error, Result};
use crate::events::DomainEvent;
use crate::models::proxy::{PROXY_IMAGE, PROXY_SKU};
use crate::models::{ErrorCode, ErrorInfo, Proxy, ProxyForward, Scaleset};
use crate::states::VmState;

/// A proxy without a heartbeat for this long is replaced.
pub const PROXY_HEARTBEAT_TIMEOUT_MINUTES: i64 = 10;

/// Ports handed out for forwards.
pub const FORWARD_PORTS: std::ops::Range<u16> = 28000..32000;

impl Proxy {
    /// Proxy of `region`, created when missing.
    ///
    /// An outdated proxy is stopped instead and `None` returned; the next pass
    /// creates its replacement once the old one is gone.
    pub async fn get_or_create(ctx: &OrchestratorContext, region: &str) -> Result<Option<Proxy>> {
        if let Some(proxy) = ctx.store.get::<Proxy>(region, region).await? {
            if proxy.version != ctx.config.service_version {
                if proxy.state != VmState::Stopping {
                    info!(region, version = %proxy.version, "Replacing outdated proxy");
                    proxy.set_state(ctx, VmState::Stopping).await?;
                }
                return Ok(None);
            }
            return Ok(Some(proxy));
        }

        let proxy = Proxy::new(region, ctx.config.service_version.clone());
        match ctx.store.insert(proxy).await {
            Ok(proxy) => {
                info!(region, "Proxy created");
                ctx.send_event(DomainEvent::ProxyCreated {
                    region: region.to_string(),
                })
                .await;
                Ok(Some(proxy))
            }
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() {
                    return Ok(ctx.store.get(region, region).await?);
                }
                Err(err)
            }
        }
    }

    /// Proxies in any of `states` (or any state).
    pub async fn search_states(ctx: &OrchestratorContext, states: &[VmState]) -> Result<Vec<Proxy>> {
        let mut filter = QueryFilter::new();
        if !states.is_empty() {
            filter = filter.field_in("state", states.iter().copied());
        }
        Ok(ctx.store.query(&filter).await?)
    }

    /// Write the proxy back.
    pub async fn save(self, ctx: &OrchestratorContext) -> Result<Proxy> {
        Ok(ctx.store.replace(self).await?)
    }

    /// Move to `state`, emitting `proxy-state-updated` when it changed.
    pub async fn set_state(mut self, ctx: &OrchestratorContext, state: VmState) -> Result<Proxy> {
        if self.state == state {
            return Ok(self);
        }

        self.state = state;
        let proxy = self.save(ctx).await?;
        ctx.send_event(DomainEvent::ProxyStateUpdated {
            region: proxy.region.clone(),
            state,
        })
        .await;
        Ok(proxy)
    }

    fn vm_spec(&self) -> VmSpec {
        VmSpec {
            name: self.vm_name(),
            region: self.region.clone(),
            sku: PROXY_SKU.to_string(),
            image: PROXY_IMAGE.to_string(),
            auth: self.auth.clone(),
        }
    }

    async fn fail(mut self, ctx: &OrchestratorContext, state: VmState, error: ErrorInfo) -> Result<Proxy> {
        error!(region = %self.region, error = %error, "Proxy failed");
        self.error = Some(error.clone());
        let proxy = self.set_state(ctx, state).await?;
        ctx.send_event(DomainEvent::ProxyFailed {
            region: proxy.region.clone(),
            error,
        })
        .await;
        Ok(proxy)
    }

    async fn set_provisioning_failed(self, ctx: &OrchestratorContext, info: &VmInfo) -> Result<Proxy> {
        let mut errors = vec![format!("vm failed to provision: {}", self.vm_name())];
        errors.extend(info.errors.iter().cloned());
        let error = ErrorInfo {
            code: ErrorCode::VmCreateFailed,
            errors,
        };
        self.fail(ctx, VmState::VmAllocationFailed, error).await
    }

    /// Create the proxy VM, or move on once it exists.
    pub async fn init(self, ctx: &OrchestratorContext) -> Result<Proxy> {
        match ctx.cloud.vm.get_vm(&self.vm_name()).await? {
            Some(info) if info.provisioning_state == ProvisioningState::Failed => {
                self.set_provisioning_failed(ctx, &info).await
            }
            Some(_) => self.set_state(ctx, VmState::ExtensionsLaunch).await,
            None => {
                info!(region = %self.region, "Creating proxy VM");
                match ctx.cloud.vm.create_vm(self.vm_spec()).await {
                    Ok(()) => self.save(ctx).await,
                    Err(e) => {
                        let error = ErrorInfo::new(ErrorCode::VmCreateFailed, e.to_string());
                        self.fail(ctx, VmState::Stopping, error).await
                    }
                }
            }
        }
    }

    /// Wait for an address, then install the proxy extensions.
    pub async fn extensions_launch(mut self, ctx: &OrchestratorContext) -> Result<Proxy> {
        let Some(info) = ctx.cloud.vm.get_vm(&self.vm_name()).await? else {
            error!(region = %self.region, "Proxy VM does not exist");
            return self.set_state(ctx, VmState::Stopping).await;
        };

        if info.provisioning_state == ProvisioningState::Failed {
            return self.set_provisioning_failed(ctx, &info).await;
        }

        let Some(ip) = info.ip else {
            debug!(region = %self.region, "Proxy VM has no address yet");
            return self.save(ctx).await;
        };
        self.ip = Some(ip);

        match ctx
            .cloud
            .vm
            .add_extensions(&self.vm_name(), vm_extensions(&self.region, "proxy"))
            .await
        {
            Ok(true) => self.set_state(ctx, VmState::Running).await,
            Ok(false) => self.save(ctx).await,
            Err(e) => {
                let error = ErrorInfo::new(ErrorCode::VmCreateFailed, e.to_string());
                self.fail(ctx, VmState::Stopping, error).await
            }
        }
    }

    /// Delete the VM; the record goes once the VM is gone.
    pub async fn stopping(self, ctx: &OrchestratorContext) -> Result<Option<Proxy>> {
        if ctx.cloud.vm.is_deleted(&self.vm_name()).await? {
            return self.stopped(ctx).await.map(|_| None);
        }

        info!(region = %self.region, "Stopping proxy");
        ctx.cloud.vm.delete_vm(&self.vm_name()).await?;
        self.save(ctx).await.map(Some)
    }

    /// Remove the record.
    pub async fn stopped(self, ctx: &OrchestratorContext) -> Result<()> {
        info!(region = %self.region, "Removing proxy");
        ctx.store.delete(&self).await?;
        ctx.send_event(DomainEvent::ProxyDeleted {
            region: self.region.clone(),
        })
        .await;
        Ok(())
    }

    /// Record a heartbeat from the proxy agent.
    pub async fn on_heartbeat(ctx: &OrchestratorContext, region: &str) -> Result<()> {
        let Some(mut proxy) = ctx.store.get::<Proxy>(region, region).await? else {
            return Err(Error::UnableToFind(format!("unable to find proxy: {region}")));
        };
        proxy.heartbeat = Some(Utc::now());
        proxy.save(ctx).await?;
        Ok(())
    }

    /// True when a heartbeat arrived within the last ten minutes.
    ///
    /// A proxy that never sent one is judged by its creation time.
    pub fn is_alive(&self) -> bool {
        let cutoff = Utc::now() - Duration::minutes(PROXY_HEARTBEAT_TIMEOUT_MINUTES);
        self.heartbeat.unwrap_or(self.created_at) >= cutoff
    }

    /// True when the proxy was deployed by another service version.
    pub fn is_outdated(&self, ctx: &OrchestratorContext) -> bool {
        self.version != ctx.config.service_version
    }

    /// True while any unexpired forward goes through the proxy.
    pub async fn is_used(&self, ctx: &OrchestratorContext) -> Result<bool> {
        let used = !self.get_forwards(ctx).await?.is_empty();
        if !used {
            debug!(region = %self.region, "Proxy has no forwards");
        }
        Ok(used)
    }

    /// Unexpired forwards of the region. Expired ones are deleted.
    pub async fn get_forwards(&self, ctx: &OrchestratorContext) -> Result<Vec<ProxyForward>> {
        let now = Utc::now();
        let mut forwards = Vec::new();
        for entry in ProxyForward::search_forwards(ctx, Some(&self.region), None, None).await? {
            if entry.end_time < now {
                ctx.store.delete(&entry).await?;
            } else {
                forwards.push(entry);
            }
        }
        Ok(forwards)
    }

    /// Stop proxies that are dead, or outdated with nothing using them.
    pub async fn check_health(mut self, ctx: &OrchestratorContext) -> Result<Proxy> {
        if self.state.available() {
            if self.outdated && !self.is_used(ctx).await? {
                info!(region = %self.region, "Stopping unused outdated proxy");
                self = self.set_state(ctx, VmState::Stopping).await?;
            } else if !self.is_alive() {
                error!(region = %self.region, "Proxy alive check failed, stopping");
                self = self.set_state(ctx, VmState::Stopping).await?;
            }
        }

        // marked after the checks so a proxy handed out this pass is not
        // stopped before anyone had a chance to use it
        if self.state != VmState::Stopped && !self.outdated && self.is_outdated(ctx) {
            self.outdated = true;
            self = self.save(ctx).await?;
        }
        Ok(self)
    }

    /// Make sure every region with a scaleset has a current proxy.
    pub async fn ensure_regions(ctx: &OrchestratorContext) -> Result<()> {
        let scalesets: Vec<Scaleset> = ctx.store.query(&QueryFilter::new()).await?;
        let regions: BTreeSet<String> = scalesets.into_iter().map(|s| s.region).collect();
        let proxies = Self::search_states(ctx, &[]).await?;

        for region in regions {
            let current = proxies
                .iter()
                .any(|p| p.region == region && !p.outdated);
            if !current && let Err(e) = Self::get_or_create(ctx, &region).await {
                e.log_entity_failure("proxy", &region);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateMachine for Proxy {
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
            VmState::Stopped => self.stopped(ctx).await.map(|_| None),
            _ => Ok(Some(self)),
        }
    }
}

impl ProxyForward {
    /// Forward a proxy port to `dst_ip:dst_port` for `duration_hours`.
    ///
    /// An existing forward to the same node port is extended instead.
    pub async fn create_forward(
        ctx: &OrchestratorContext,
        region: &str,
        scaleset_id: Uuid,
        machine_id: Uuid,
        dst_ip: &str,
        dst_port: u16,
        duration_hours: i64,
    ) -> Result<ProxyForward> {
        let end_time = Utc::now() + Duration::hours(duration_hours);

        let existing = Self::search_forwards(ctx, Some(region), Some(scaleset_id), Some(machine_id))
            .await?
            .into_iter()
            .find(|f| f.dst_port == dst_port);
        if let Some(mut entry) = existing {
            entry.end_time = end_time;
            return Ok(ctx.store.replace(entry).await?);
        }

        for port in FORWARD_PORTS {
            let entry = ProxyForward::new(region, port, scaleset_id, machine_id, dst_ip, dst_port, end_time);
            match ctx.store.insert(entry).await {
                Ok(entry) => {
                    info!(region, port, machine_id = %machine_id, dst_port, "Proxy forward created");
                    return Ok(entry);
                }
                Err(e) => {
                    let err = Error::from(e);
                    if !err.is_already_exists() {
                        return Err(err);
                    }
                    debug!(region, port, "Port already used");
                }
            }
        }

        Err(Error::UnableToCreate("all forward ports used".to_string()))
    }

    /// Forwards matching every given criterion.
    pub async fn search_forwards(
        ctx: &OrchestratorContext,
        region: Option<&str>,
        scaleset_id: Option<Uuid>,
        machine_id: Option<Uuid>,
    ) -> Result<Vec<ProxyForward>> {
        let mut filter = QueryFilter::new();
        if let Some(region) = region {
            filter = filter.partition(region);
        }
        if let Some(id) = scaleset_id {
            filter = filter.field_eq("scaleset_id", id.to_string());
        }
        if let Some(id) = machine_id {
            filter = filter.field_eq("machine_id", id.to_string());
        }
        Ok(ctx.store.query(&filter).await?)
    }

    /// Delete matching forwards. Returns the regions that had any.
    pub async fn remove_forwards(
        ctx: &OrchestratorContext,
        scaleset_id: Option<Uuid>,
        machine_id: Option<Uuid>,
    ) -> Result<Vec<String>> {
        let mut regions = BTreeSet::new();
        for entry in Self::search_forwards(ctx, None, scaleset_id, machine_id).await? {
            ctx.store.delete(&entry).await?;
            regions.insert(entry.region);
        }
        Ok(regions.into_iter().collect())
    }
}
