//! Guest Workflows
//!
//! Stage handlers for every guest lifecycle workflow. Each handler moves the
//! guest/disk records it acts on through their statuses and calls exactly
//! one capability driver method per stage.
//!
//! Parameter bags, per workflow:
//!
//! | Workflow | Params |
//! |---|---|
//! | `GuestCreateTask` | `auto_start`, `image_id` |
//! | `DiskCreateTask` | `guest_id` |
//! | `GuestSyncstatusTask` | result data: `status` |
//! | `GuestDeleteTask` | `purge`, `prev_status` |
//! | `GuestChangeConfigTask` | `vcpu_count`, `vmem_size_mb`, `prev_status` |
//! | `DiskResizeTask` | `guest_id`, `size_mb`, `prev_status` |
//! | `GuestRebuildRootTask` | `image_id`, `prev_status` |
//! | `GuestDetachDiskTask` | `disk_id`, `keep_disk`, `purge`, `prev_status` |
//! | `GuestAttachDiskTask` | `disk_id`, `prev_status` |
//! | `BaremetalConvertHypervisorTask` | `server_id`, `server_params` |

pub mod convert;
pub mod create;
pub mod lifecycle;
pub mod reconfig;

use crate::domain::model::{Disk, DiskStatus, Guest, GuestStatus};
use crate::domain::ports::{workflows, GuestStoreRef};
use crate::drivers::{DriverRegistryRef, GuestDriverRef};
use crate::error::Result;
use crate::task::engine::{StageContext, TaskEngineBuilder};
use crate::task::record::{ParamsExt, TaskParams};
use crate::task::workflow::WorkflowStage;
use serde_json::json;
use tracing::warn;

/// Collaborators shared by the guest workflows
#[derive(Clone)]
pub struct GuestTaskDeps {
    pub drivers: DriverRegistryRef,
    pub store: GuestStoreRef,
}

impl GuestTaskDeps {
    pub fn new(drivers: DriverRegistryRef, store: GuestStoreRef) -> Self {
        Self { drivers, store }
    }

    pub(crate) fn driver(&self, guest: &Guest) -> Result<GuestDriverRef> {
        self.drivers.guest_driver(&guest.provider)
    }

    /// Guest the task targets
    pub(crate) async fn target_guest<S: WorkflowStage>(&self, ctx: &StageContext<S>) -> Result<Guest> {
        self.store.require_guest(&ctx.target().id).await
    }

    pub(crate) async fn disks_of(&self, guest: &Guest) -> Result<Vec<Disk>> {
        let mut disks = Vec::with_capacity(guest.disks.len());
        for id in &guest.disks {
            disks.push(self.store.require_disk(id).await?);
        }
        Ok(disks)
    }

    /// Record the guest's current status as `prev_status` and move it to `status`
    pub(crate) async fn enter_status(
        &self,
        guest_id: &str,
        status: GuestStatus,
    ) -> Result<(Guest, TaskParams)> {
        let prev = self.store.require_guest(guest_id).await?.status;
        let guest = self.store.set_guest_status(guest_id, status).await?;
        let params = crate::task::record::params(json!({ "prev_status": prev }));
        Ok((guest, params))
    }

    /// Put the guest back to the status recorded by `enter_status`
    pub(crate) async fn restore_status<S: WorkflowStage>(&self, ctx: &StageContext<S>, guest_id: &str) {
        let prev = match ctx.params().typed::<GuestStatus>("prev_status") {
            Ok(Some(prev)) => prev,
            _ => return,
        };
        if let Err(e) = self.store.set_guest_status(guest_id, prev).await {
            warn!(guest_id, "Failed to restore guest status: {}", e);
        }
    }

    /// Best-effort status change on a failure path
    pub(crate) async fn mark_status(&self, guest_id: &str, status: GuestStatus) {
        if let Err(e) = self.store.set_guest_status(guest_id, status).await {
            warn!(guest_id, status = %status, "Failed to update guest status: {}", e);
        }
    }

    pub(crate) async fn mark_disk_status(&self, disk_id: &str, status: DiskStatus) {
        let result = match self.store.require_disk(disk_id).await {
            Ok(mut disk) => {
                disk.status = status;
                self.store.update_disk(disk).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(disk_id, status = %status, "Failed to update disk status: {}", e);
        }
    }
}

/// Register every guest workflow on `builder`
pub fn register_guest_workflows(builder: &mut TaskEngineBuilder, deps: &GuestTaskDeps) {
    builder
        .register(workflows::GUEST_CREATE_TASK, create::GuestCreateTask::new(deps.clone()))
        .register(workflows::DISK_CREATE_TASK, create::DiskCreateTask::new(deps.clone()))
        .register(workflows::GUEST_START_TASK, create::GuestStartTask::new(deps.clone()))
        .register(
            workflows::GUEST_SYNCSTATUS_TASK,
            create::GuestSyncstatusTask::new(deps.clone()),
        )
        .register(workflows::GUEST_DELETE_TASK, lifecycle::GuestDeleteTask::new(deps.clone()))
        .register(
            workflows::GUEST_CHANGE_CONFIG_TASK,
            reconfig::GuestChangeConfigTask::new(deps.clone()),
        )
        .register(workflows::DISK_RESIZE_TASK, reconfig::DiskResizeTask::new(deps.clone()))
        .register(
            workflows::GUEST_REBUILD_ROOT_TASK,
            reconfig::GuestRebuildRootTask::new(deps.clone()),
        )
        .register(
            workflows::GUEST_DETACH_DISK_TASK,
            reconfig::GuestDetachDiskTask::new(deps.clone()),
        )
        .register(
            workflows::GUEST_ATTACH_DISK_TASK,
            reconfig::GuestAttachDiskTask::new(deps.clone()),
        )
        .register(
            workflows::BAREMETAL_CONVERT_HYPERVISOR_TASK,
            convert::BaremetalConvertHypervisorTask::new(deps.clone()),
        );
}
