//! Guest Lifecycle Orchestrator
//!
//! Turns a guest verb into a driver resolution, a legality check against the
//! driver's status predicates, an optional quota reservation and a root task.
//! Validation and eligibility failures surface here, before any task or
//! reservation exists.

use crate::domain::model::{Disk, DiskStatus, DiskType, Guest, GuestStatus, Host};
use crate::domain::ports::{
    workflows, BillingCycle, Credential, GuestStoreRef, ResourceRef, ServerCreateInput,
};
use crate::drivers::guest::ensure_status;
use crate::drivers::{DriverRegistryRef, GuestDriverRef, GuestTaskRequest};
use crate::error::{Error, Result};
use crate::quota::{QuotaDeltas, QuotaResource, QuotaScope, Reservation};
use crate::task::engine::{TaskEngine, TaskHandle};
use crate::task::record::{params, NewTask, TaskParams};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Reserve quota for operations that change billable resources
    pub track_quota: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { track_quota: true }
    }
}

/// An accepted operation: the resource it acts on and its root task
#[derive(Debug, Clone)]
pub struct Accepted {
    pub resource: ResourceRef,
    pub task: TaskHandle,
}

/// Task graph a create request runs
enum CreatePlan {
    Guest,
    Convert(Host),
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct GuestOrchestrator {
    config: OrchestratorConfig,
    engine: TaskEngine,
    drivers: DriverRegistryRef,
    store: GuestStoreRef,
}

impl GuestOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        engine: TaskEngine,
        drivers: DriverRegistryRef,
        store: GuestStoreRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            engine,
            drivers,
            store,
        })
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub async fn get_guest(&self, guest_id: &str) -> Result<Guest> {
        self.store.require_guest(guest_id).await
    }

    pub async fn list_guests(&self) -> Result<Vec<Guest>> {
        self.store.list_guests().await
    }

    fn reserve(&self, scope: QuotaScope, deltas: QuotaDeltas) -> Result<Option<Reservation>> {
        if !self.config.track_quota || deltas.is_empty() {
            return Ok(None);
        }
        self.engine.quota().reserve(&scope, deltas).map(Some)
    }

    fn release(&self, reservation: &Option<Reservation>) {
        if let Some(reservation) = reservation {
            if let Err(e) = self.engine.quota().cancel(&reservation.id) {
                warn!(reservation_id = %reservation.id, "Failed to release reservation: {}", e);
            }
        }
    }

    /// Start a root task, releasing `reservation` if it never gets an owner
    async fn start_task(&self, request: NewTask) -> Result<TaskHandle> {
        let reservation = request.reservation.clone();
        self.engine.start(request).await.map_err(|e| {
            self.release(&reservation);
            e
        })
    }

    async fn guest_and_driver(&self, guest_id: &str) -> Result<(Guest, GuestDriverRef)> {
        let guest = self.store.require_guest(guest_id).await?;
        let driver = self.drivers.guest_driver(&guest.provider)?;
        Ok((guest, driver))
    }

    async fn attached_disk(&self, guest: &Guest, disk_id: &str) -> Result<Disk> {
        let disk = self.store.require_disk(disk_id).await?;
        if disk.guest_id.as_deref() != Some(guest.id.as_str()) {
            return Err(Error::ValidationFailed(format!(
                "disk {} is not attached to guest {}",
                disk_id, guest.id
            )));
        }
        Ok(disk)
    }

    // -------------------------------------------------------------------------
    // Create / Delete
    // -------------------------------------------------------------------------

    pub async fn create_guest(
        &self,
        credential: &Credential,
        input: ServerCreateInput,
    ) -> Result<Accepted> {
        let driver = self.drivers.guest_driver(&input.provider)?;

        if let Some(cycle) = &input.billing_cycle {
            let parsed: BillingCycle = cycle.parse()?;
            if !driver.is_supported_billing_cycle(&parsed) {
                return Err(Error::ValidationFailed(format!(
                    "billing cycle {} is not supported by {}",
                    cycle,
                    driver.provider()
                )));
            }
        }

        let input = driver.validate_create_data(credential, input).await?;
        let plan = self.create_plan(&input).await?;

        let deltas =
            QuotaDeltas::for_guest(input.vcpu_count, input.vmem_size_mb, input.storage_mb());
        let reservation = self.reserve(QuotaScope::from(credential), deltas)?;

        let guest = match self.persist_new_guest(credential, &input, &driver).await {
            Ok(guest) => guest,
            Err(e) => {
                self.release(&reservation);
                return Err(e);
            }
        };

        let create_params = params(json!({
            "guest_id": guest.id,
            "auto_start": input.auto_start,
            "image_id": input.image_id,
        }));
        let request = match plan {
            CreatePlan::Guest => GuestTaskRequest {
                workflow: workflows::GUEST_CREATE_TASK.to_string(),
                target: ResourceRef::guest(&guest.id),
                credential: credential.clone(),
                params: create_params,
                reservation: reservation.clone(),
                parent_id: None,
            },
            CreatePlan::Convert(host) => GuestTaskRequest {
                workflow: workflows::BAREMETAL_CONVERT_HYPERVISOR_TASK.to_string(),
                target: ResourceRef::host(&host.id),
                credential: credential.clone(),
                params: params(json!({
                    "server_id": guest.id,
                    "server_params": create_params,
                })),
                reservation: reservation.clone(),
                parent_id: None,
            },
        };

        let task = match driver.start_guest_create_task(&self.engine, request).await {
            Ok(task) => task,
            Err(e) => {
                self.release(&reservation);
                if let Err(status_err) = self
                    .store
                    .set_guest_status(&guest.id, GuestStatus::CreateFailed)
                    .await
                {
                    warn!(guest_id = %guest.id, "Failed to mark guest create failed: {}", status_err);
                }
                return Err(e);
            }
        };

        info!(
            guest_id = %guest.id,
            provider = %guest.provider,
            task_id = %task.id(),
            "Accepted guest create"
        );
        Ok(Accepted {
            resource: ResourceRef::guest(&guest.id),
            task,
        })
    }

    /// Resolve the embedded workflow override of a create request
    async fn create_plan(&self, input: &ServerCreateInput) -> Result<CreatePlan> {
        let Some(name) = input.embedded_task.as_deref() else {
            return Ok(CreatePlan::Guest);
        };

        match name {
            workflows::GUEST_CREATE_TASK => Ok(CreatePlan::Guest),
            workflows::CONVERT_TASK_ALIAS | workflows::BAREMETAL_CONVERT_HYPERVISOR_TASK => {
                let host_id = input.preferred_host().ok_or_else(|| {
                    Error::ValidationFailed(
                        "conversion requires prefer_host_id or prefer_baremetal_id".into(),
                    )
                })?;
                let host = self.store.require_host(host_id).await?;
                if !host.is_baremetal() {
                    return Err(Error::InvalidState {
                        resource: format!("host/{}", host.id),
                        status: "hypervisor".into(),
                        operation: "convert".into(),
                    });
                }
                Ok(CreatePlan::Convert(host))
            }
            other => Err(Error::UnknownWorkflow {
                workflow: other.to_string(),
            }),
        }
    }

    async fn persist_new_guest(
        &self,
        credential: &Credential,
        input: &ServerCreateInput,
        driver: &GuestDriverRef,
    ) -> Result<Guest> {
        let mut guest = Guest::new(&input.name, &input.provider);
        guest.vcpu_count = input.vcpu_count;
        guest.vmem_size_mb = input.vmem_size_mb;
        guest.image_id = input.image_id.clone();
        guest.host_id = input.preferred_host().map(str::to_string);
        guest.domain_id = credential.domain_id.clone();
        guest.project_id = credential.project_id.clone();

        for (index, config) in input.disks.iter().enumerate() {
            let backend = config
                .backend
                .clone()
                .unwrap_or_else(|| driver.default_sys_disk_backend().to_string());
            let mut disk = Disk::new(format!("{}-disk{}", input.name, index), config.size_mb, backend);
            if index == 0 {
                disk.disk_type = DiskType::Sys;
                disk.image_id = config.image_id.clone().or_else(|| input.image_id.clone());
            }
            guest.disks.push(disk.id.clone());
            self.store.insert_disk(disk).await?;
        }

        self.store.insert_guest(guest.clone()).await?;
        Ok(guest)
    }

    pub async fn delete_guest(
        &self,
        credential: &Credential,
        guest_id: &str,
        purge: bool,
    ) -> Result<Accepted> {
        let (guest, driver) = self.guest_and_driver(guest_id).await?;
        if matches!(guest.status, GuestStatus::Deleting | GuestStatus::Deleted) {
            return Err(Error::InvalidState {
                resource: format!("guest/{}", guest.id),
                status: guest.status.to_string(),
                operation: "delete".into(),
            });
        }

        // Only usage that was committed by a finished create is released
        let deltas = if guest.external_id.is_some() {
            let disks = self.store_disks(&guest).await?;
            let storage_mb = disks.iter().map(|d| d.size_mb).sum();
            QuotaDeltas::for_guest(guest.vcpu_count, guest.vmem_size_mb, storage_mb).negated()
        } else {
            QuotaDeltas::new()
        };
        let reservation = self.reserve(guest_scope(&guest), deltas)?;

        let request = GuestTaskRequest {
            workflow: workflows::GUEST_DELETE_TASK.to_string(),
            target: ResourceRef::guest(&guest.id),
            credential: credential.clone(),
            params: params(json!({ "purge": purge })),
            reservation: reservation.clone(),
            parent_id: None,
        };
        let task = driver
            .start_delete_guest_task(&self.engine, request)
            .await
            .map_err(|e| {
                self.release(&reservation);
                e
            })?;

        info!(guest_id = %guest.id, task_id = %task.id(), purge, "Accepted guest delete");
        Ok(Accepted {
            resource: ResourceRef::guest(&guest.id),
            task,
        })
    }

    async fn store_disks(&self, guest: &Guest) -> Result<Vec<Disk>> {
        let mut disks = Vec::with_capacity(guest.disks.len());
        for id in &guest.disks {
            if let Some(disk) = self.store.get_disk(id).await? {
                disks.push(disk);
            }
        }
        Ok(disks)
    }

    // -------------------------------------------------------------------------
    // Reconfiguration
    // -------------------------------------------------------------------------

    pub async fn change_config(
        &self,
        credential: &Credential,
        guest_id: &str,
        vcpu_count: Option<u32>,
        vmem_size_mb: Option<u64>,
    ) -> Result<Accepted> {
        let (guest, driver) = self.guest_and_driver(guest_id).await?;
        if !driver.allow_reconfig_guest() {
            return Err(Error::not_implemented(driver.provider(), "change_config"));
        }
        ensure_status(&driver.change_config_status()?, &guest, "change_config")?;

        let vcpu_count = vcpu_count.unwrap_or(guest.vcpu_count);
        let vmem_size_mb = vmem_size_mb.unwrap_or(guest.vmem_size_mb);
        if vcpu_count == 0 || vmem_size_mb == 0 {
            return Err(Error::ValidationFailed(
                "vcpu_count and vmem_size_mb must be positive".into(),
            ));
        }
        if vcpu_count == guest.vcpu_count && vmem_size_mb == guest.vmem_size_mb {
            return Err(Error::ValidationFailed("configuration is unchanged".into()));
        }

        let deltas = QuotaDeltas::new()
            .with(QuotaResource::Cpu, vcpu_count as i64 - guest.vcpu_count as i64)
            .with(
                QuotaResource::MemoryMb,
                vmem_size_mb as i64 - guest.vmem_size_mb as i64,
            );
        let reservation = self.reserve(guest_scope(&guest), deltas)?;

        let task = self
            .start_task(
                NewTask::new(
                    workflows::GUEST_CHANGE_CONFIG_TASK,
                    ResourceRef::guest(&guest.id),
                    credential.clone(),
                )
                .with_params(params(json!({
                    "vcpu_count": vcpu_count,
                    "vmem_size_mb": vmem_size_mb,
                })))
                .with_reservation(reservation),
            )
            .await?;

        Ok(Accepted {
            resource: ResourceRef::guest(&guest.id),
            task,
        })
    }

    /// Resizing is legal wherever detaching is, then subject to the driver's checks
    pub async fn resize_disk(
        &self,
        credential: &Credential,
        guest_id: &str,
        disk_id: &str,
        size_mb: u64,
    ) -> Result<Accepted> {
        let (guest, driver) = self.guest_and_driver(guest_id).await?;
        ensure_status(&driver.detach_disk_status()?, &guest, "resize_disk")?;

        let disk = self.attached_disk(&guest, disk_id).await?;
        driver.validate_resize_disk(&guest, &disk, size_mb)?;

        let deltas = QuotaDeltas::new().with(
            QuotaResource::StorageMb,
            size_mb as i64 - disk.size_mb as i64,
        );
        let reservation = self.reserve(guest_scope(&guest), deltas)?;

        let task = self
            .start_task(
                NewTask::new(
                    workflows::DISK_RESIZE_TASK,
                    ResourceRef::disk(&disk.id),
                    credential.clone(),
                )
                .with_params(params(json!({
                    "guest_id": guest.id,
                    "size_mb": size_mb,
                })))
                .with_reservation(reservation),
            )
            .await?;

        Ok(Accepted {
            resource: ResourceRef::disk(&disk.id),
            task,
        })
    }

    pub async fn rebuild_root(
        &self,
        credential: &Credential,
        guest_id: &str,
        image_id: Option<String>,
    ) -> Result<Accepted> {
        let (guest, driver) = self.guest_and_driver(guest_id).await?;
        ensure_status(&driver.rebuild_root_status()?, &guest, "rebuild_root")?;

        let task = self
            .start_task(
                NewTask::new(
                    workflows::GUEST_REBUILD_ROOT_TASK,
                    ResourceRef::guest(&guest.id),
                    credential.clone(),
                )
                .with_params(params(json!({ "image_id": image_id }))),
            )
            .await?;

        Ok(Accepted {
            resource: ResourceRef::guest(&guest.id),
            task,
        })
    }

    pub async fn detach_disk(
        &self,
        credential: &Credential,
        guest_id: &str,
        disk_id: &str,
        keep_disk: bool,
        purge: bool,
    ) -> Result<Accepted> {
        let (guest, driver) = self.guest_and_driver(guest_id).await?;
        ensure_status(&driver.detach_disk_status()?, &guest, "detach_disk")?;

        let disk = self.attached_disk(&guest, disk_id).await?;
        if disk.disk_type == DiskType::Sys {
            return Err(Error::ValidationFailed(
                "the system disk cannot be detached".into(),
            ));
        }

        let task = self
            .start_task(
                NewTask::new(
                    workflows::GUEST_DETACH_DISK_TASK,
                    ResourceRef::guest(&guest.id),
                    credential.clone(),
                )
                .with_params(detach_params(&disk, keep_disk, purge)),
            )
            .await?;

        Ok(Accepted {
            resource: ResourceRef::guest(&guest.id),
            task,
        })
    }

    pub async fn attach_disk(
        &self,
        credential: &Credential,
        guest_id: &str,
        disk_id: &str,
    ) -> Result<Accepted> {
        let (guest, driver) = self.guest_and_driver(guest_id).await?;
        ensure_status(&driver.attach_disk_status()?, &guest, "attach_disk")?;

        let disk = self.store.require_disk(disk_id).await?;
        if disk.guest_id.is_some() || disk.status != DiskStatus::Ready {
            return Err(Error::InvalidState {
                resource: format!("disk/{}", disk.id),
                status: disk.status.to_string(),
                operation: "attach_disk".into(),
            });
        }

        let task = self
            .start_task(
                NewTask::new(
                    workflows::GUEST_ATTACH_DISK_TASK,
                    ResourceRef::guest(&guest.id),
                    credential.clone(),
                )
                .with_params(params(json!({ "disk_id": disk.id }))),
            )
            .await?;

        Ok(Accepted {
            resource: ResourceRef::guest(&guest.id),
            task,
        })
    }
}

fn guest_scope(guest: &Guest) -> QuotaScope {
    QuotaScope::new(&guest.domain_id, &guest.project_id)
}

fn detach_params(disk: &Disk, keep_disk: bool, purge: bool) -> TaskParams {
    params(json!({
        "disk_id": disk.id,
        "keep_disk": keep_disk,
        "purge": purge,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::ControlPlane;
    use crate::domain::model::{HostType, MemoryGuestStore};
    use crate::domain::ports::{providers, storage, DiskConfig};
    use crate::drivers::{DriverEnvironment, SimulatedCloud};
    use crate::quota::ReservationState;
    use crate::task::engine::TaskEngine;
    use crate::task::record::TaskStatus;
    use crate::task::retry::StageRetry;
    use assert_matches::assert_matches;

    struct Harness {
        plane: ControlPlane,
        aliyun: Arc<SimulatedCloud>,
    }

    fn harness() -> Harness {
        let aliyun = SimulatedCloud::new(providers::ALIYUN);
        let env = DriverEnvironment::new(StageRetry::none())
            .with_cloud(aliyun.clone())
            .with_cloud(SimulatedCloud::new(providers::AZURE));
        let enabled = [providers::ALIYUN, providers::AZURE, providers::QCLOUD].map(String::from);

        let plane = ControlPlane::assemble(
            &env,
            &enabled,
            Arc::new(MemoryGuestStore::new()),
            TaskEngine::builder(),
            OrchestratorConfig::default(),
        )
        .unwrap();
        Harness { plane, aliyun }
    }

    fn cred() -> Credential {
        Credential::new("default", "p1")
    }

    fn aliyun_input(sys_gb: u64) -> ServerCreateInput {
        ServerCreateInput {
            name: "web".into(),
            provider: providers::ALIYUN.into(),
            vcpu_count: 2,
            vmem_size_mb: 4096,
            disks: vec![
                DiskConfig::new(sys_gb * 1024),
                DiskConfig::new(100 * 1024).with_backend(storage::CLOUD_SSD),
            ],
            auto_start: true,
            image_id: Some("img-linux".into()),
            ..Default::default()
        }
    }

    fn usage(h: &Harness, resource: QuotaResource) -> i64 {
        h.plane
            .engine
            .quota()
            .usage(&QuotaScope::from(&cred()))
            .get(&resource)
            .copied()
            .unwrap_or(0)
    }

    async fn running_guest(h: &Harness) -> Guest {
        let accepted = h
            .plane
            .orchestrator
            .create_guest(&cred(), aliyun_input(40))
            .await
            .unwrap();
        let record = accepted.task.wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Complete, "{:?}", record.error);
        h.plane.orchestrator.get_guest(&accepted.resource.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_undersized_system_disk_is_rejected_before_any_task() {
        let h = harness();
        let err = h
            .plane
            .orchestrator
            .create_guest(&cred(), aliyun_input(10))
            .await
            .unwrap_err();

        assert_matches!(err, Error::ValidationFailed(_));
        assert!(h.plane.engine.list().await.unwrap().is_empty());
        assert!(h.plane.store.list_guests().await.unwrap().is_empty());
        assert!(h.plane.engine.quota().pending(&QuotaScope::from(&cred())).is_empty());
    }

    #[tokio::test]
    async fn test_create_then_delete() {
        let h = harness();
        let guest = running_guest(&h).await;

        assert_eq!(guest.status, GuestStatus::Running);
        assert!(guest.external_id.is_some());
        assert_eq!(guest.disks.len(), 2);
        let sys = h.plane.store.require_disk(&guest.disks[0]).await.unwrap();
        assert_eq!(sys.disk_type, DiskType::Sys);
        assert_eq!(sys.backend, storage::CLOUD_EFFICIENCY);
        assert_eq!(sys.status, DiskStatus::Ready);
        assert_eq!(usage(&h, QuotaResource::Guests), 1);
        assert_eq!(usage(&h, QuotaResource::Cpu), 2);
        assert_eq!(usage(&h, QuotaResource::StorageMb), 140 * 1024);

        let accepted = h
            .plane
            .orchestrator
            .delete_guest(&cred(), &guest.id, false)
            .await
            .unwrap();
        let record = accepted.task.wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Complete, "{:?}", record.error);

        let guest = h.plane.orchestrator.get_guest(&guest.id).await.unwrap();
        assert_eq!(guest.status, GuestStatus::Deleted);
        assert_eq!(h.aliyun.vm_count().await, 0);
        assert_eq!(usage(&h, QuotaResource::Guests), 0);
        assert_eq!(usage(&h, QuotaResource::StorageMb), 0);

        let err = h
            .plane
            .orchestrator
            .delete_guest(&cred(), &guest.id, false)
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidState { .. });
    }

    #[tokio::test]
    async fn test_backend_failure_cancels_reservation() {
        let h = harness();
        h.aliyun.fail_next("create_vm", 1);

        let accepted = h
            .plane
            .orchestrator
            .create_guest(&cred(), aliyun_input(40))
            .await
            .unwrap();
        let record = accepted.task.wait().await.unwrap();

        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_ref().unwrap().kind, "backend_failure");
        let reservation = record.reservation.as_ref().unwrap();
        let reservation = h.plane.engine.quota().get(&reservation.id).unwrap();
        assert_eq!(reservation.state, ReservationState::Cancelled);
        assert_eq!(usage(&h, QuotaResource::Guests), 0);

        let guest = h.plane.orchestrator.get_guest(&accepted.resource.id).await.unwrap();
        assert_eq!(guest.status, GuestStatus::CreateFailed);
    }

    #[tokio::test]
    async fn test_resize_on_running_azure_guest_is_invalid_state() {
        let h = harness();
        let mut guest = Guest::new("vm", providers::AZURE);
        guest.status = GuestStatus::Running;
        let mut disk = Disk::new("vm-disk1", 64 * 1024, storage::STANDARD_LRS);
        disk.guest_id = Some(guest.id.clone());
        guest.disks.push(disk.id.clone());
        h.plane.store.insert_disk(disk.clone()).await.unwrap();
        h.plane.store.insert_guest(guest.clone()).await.unwrap();

        let err = h
            .plane
            .orchestrator
            .resize_disk(&cred(), &guest.id, &disk.id, 128 * 1024)
            .await
            .unwrap_err();

        assert_matches!(err, Error::InvalidState { operation, .. } if operation == "resize_disk");
        assert!(h.plane.engine.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_convert_override_dispatches_conversion_workflow() {
        let h = harness();
        let host = Host::baremetal("bm-01");
        h.plane.store.insert_host(host.clone()).await.unwrap();

        let input = ServerCreateInput {
            embedded_task: Some(workflows::CONVERT_TASK_ALIAS.into()),
            prefer_baremetal_id: Some(host.id.clone()),
            ..aliyun_input(40)
        };
        let accepted = h.plane.orchestrator.create_guest(&cred(), input).await.unwrap();

        let record = accepted.task.record().await.unwrap();
        assert_eq!(record.name, workflows::BAREMETAL_CONVERT_HYPERVISOR_TASK);
        assert_eq!(record.target, ResourceRef::host(&host.id));

        let record = accepted.task.wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Complete, "{:?}", record.error);
        assert_eq!(record.stage_path(), vec!["init", "on_guest_deployed"]);

        let host = h.plane.store.require_host(&host.id).await.unwrap();
        assert_eq!(host.host_type, HostType::Hypervisor);
        let children = h.plane.engine.children(&record.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, workflows::GUEST_CREATE_TASK);
        assert_eq!(usage(&h, QuotaResource::Guests), 1);
    }

    #[tokio::test]
    async fn test_unknown_override_is_rejected() {
        let h = harness();
        let input = ServerCreateInput {
            embedded_task: Some("MysteryTask".into()),
            ..aliyun_input(40)
        };
        let err = h.plane.orchestrator.create_guest(&cred(), input).await.unwrap_err();

        assert_matches!(err, Error::UnknownWorkflow { workflow } if workflow == "MysteryTask");
        assert!(h.plane.engine.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_change_config_reserves_the_difference() {
        let h = harness();
        let guest = running_guest(&h).await;

        let accepted = h
            .plane
            .orchestrator
            .change_config(&cred(), &guest.id, Some(4), None)
            .await
            .unwrap();
        let record = accepted.task.wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Complete, "{:?}", record.error);

        let guest = h.plane.orchestrator.get_guest(&guest.id).await.unwrap();
        assert_eq!(guest.vcpu_count, 4);
        assert_eq!(guest.status, GuestStatus::Running);
        assert_eq!(usage(&h, QuotaResource::Cpu), 4);
        assert_eq!(usage(&h, QuotaResource::MemoryMb), 4096);
    }

    #[tokio::test]
    async fn test_resize_and_detach_data_disk() {
        let h = harness();
        let guest = running_guest(&h).await;
        let data_disk = guest.disks[1].clone();

        let err = h
            .plane
            .orchestrator
            .resize_disk(&cred(), &guest.id, &guest.disks[0], 80 * 1024)
            .await
            .unwrap_err();
        assert_matches!(err, Error::ValidationFailed(_));

        let accepted = h
            .plane
            .orchestrator
            .resize_disk(&cred(), &guest.id, &data_disk, 200 * 1024)
            .await
            .unwrap();
        let record = accepted.task.wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Complete, "{:?}", record.error);
        let disk = h.plane.store.require_disk(&data_disk).await.unwrap();
        assert_eq!(disk.size_mb, 200 * 1024);
        assert_eq!(usage(&h, QuotaResource::StorageMb), 240 * 1024);

        let accepted = h
            .plane
            .orchestrator
            .detach_disk(&cred(), &guest.id, &data_disk, true, false)
            .await
            .unwrap();
        let record = accepted.task.wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Complete, "{:?}", record.error);

        let guest = h.plane.orchestrator.get_guest(&guest.id).await.unwrap();
        assert_eq!(guest.disks.len(), 1);
        assert_eq!(guest.status, GuestStatus::Running);
        let disk = h.plane.store.require_disk(&data_disk).await.unwrap();
        assert!(disk.guest_id.is_none());
        assert_eq!(disk.status, DiskStatus::Ready);

        let accepted = h
            .plane
            .orchestrator
            .attach_disk(&cred(), &guest.id, &data_disk)
            .await
            .unwrap();
        let record = accepted.task.wait().await.unwrap();
        assert_eq!(record.status, TaskStatus::Complete, "{:?}", record.error);
        let guest = h.plane.orchestrator.get_guest(&guest.id).await.unwrap();
        assert_eq!(guest.disks.len(), 2);
    }

    #[tokio::test]
    async fn test_azure_rebuild_is_not_implemented() {
        let h = harness();
        let mut guest = Guest::new("vm", providers::AZURE);
        guest.status = GuestStatus::Ready;
        h.plane.store.insert_guest(guest.clone()).await.unwrap();

        let err = h
            .plane
            .orchestrator
            .rebuild_root(&cred(), &guest.id, None)
            .await
            .unwrap_err();
        assert!(err.is_not_implemented());
    }
}
