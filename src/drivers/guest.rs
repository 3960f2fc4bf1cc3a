//! Guest Capability Driver
//!
//! The fixed capability set a hypervisor or cloud provider implements for
//! guests and their disks. Every optional operation has a default, most of
//! them `NotImplemented`; drivers override what their backend supports.
//! Mutating requests only acknowledge that work was scheduled: results reach
//! the workflow through the task's own stage progression.

use crate::domain::model::{Disk, DiskStatus, Guest, GuestStatus, Host};
use crate::domain::ports::{BillingCycle, Credential, GuestStoreRef, ResourceRef, ServerCreateInput};
use crate::error::{Error, Result};
use crate::quota::Reservation;
use crate::task::engine::{TaskEngine, TaskHandle};
use crate::task::record::{NewTask, ParamsExt, TaskId, TaskParams};
use async_trait::async_trait;
use serde_json::json;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::debug;

/// Root or child task a driver is asked to start
#[derive(Debug, Clone)]
pub struct GuestTaskRequest {
    pub workflow: String,
    pub target: ResourceRef,
    pub credential: Credential,
    pub params: TaskParams,
    pub reservation: Option<Reservation>,
    pub parent_id: Option<TaskId>,
}

impl GuestTaskRequest {
    pub fn into_new_task(self) -> NewTask {
        let mut task = NewTask::new(self.workflow, self.target, self.credential)
            .with_params(self.params)
            .with_reservation(self.reservation);
        if let Some(parent_id) = self.parent_id {
            task = task.with_parent(parent_id);
        }
        task
    }
}

/// What a finished deploy continues with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFollowUp {
    AutoStart,
    SyncStatus,
}

fn unsupported<T>(provider: &str, operation: &str) -> Result<T> {
    Err(Error::not_implemented(provider, operation))
}

/// Provider-specific guest lifecycle operations
#[async_trait]
pub trait GuestDriver: Send + Sync {
    /// Registry key
    fn provider(&self) -> &'static str;

    // =========================================================================
    // Constraints
    // =========================================================================

    fn default_sys_disk_backend(&self) -> &'static str;

    fn minimal_sys_disk_size_gb(&self) -> u64;

    fn storage_types(&self) -> &'static [&'static str];

    /// Allowed size of a disk on `backend`, if the driver constrains it
    fn disk_size_range_gb(&self, _backend: &str) -> Option<RangeInclusive<u64>> {
        None
    }

    fn is_supported_billing_cycle(&self, _cycle: &BillingCycle) -> bool {
        false
    }

    fn allow_reconfig_guest(&self) -> bool {
        true
    }

    fn guest_initial_state_after_create(&self) -> GuestStatus {
        GuestStatus::Ready
    }

    fn guest_initial_state_after_rebuild(&self) -> GuestStatus {
        GuestStatus::Ready
    }

    fn linux_default_account(&self, _image_type: &str, _os_type: &str) -> String {
        "root".to_string()
    }

    // =========================================================================
    // Status Predicates
    // =========================================================================

    fn detach_disk_status(&self) -> Result<Vec<GuestStatus>> {
        unsupported(self.provider(), "detach_disk_status")
    }

    fn attach_disk_status(&self) -> Result<Vec<GuestStatus>> {
        unsupported(self.provider(), "attach_disk_status")
    }

    fn rebuild_root_status(&self) -> Result<Vec<GuestStatus>> {
        unsupported(self.provider(), "rebuild_root_status")
    }

    fn change_config_status(&self) -> Result<Vec<GuestStatus>> {
        unsupported(self.provider(), "change_config_status")
    }

    fn deploy_status(&self) -> Result<Vec<GuestStatus>> {
        unsupported(self.provider(), "deploy_status")
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check and normalize a create request before any task exists
    async fn validate_create_data(
        &self,
        _credential: &Credential,
        input: ServerCreateInput,
    ) -> Result<ServerCreateInput> {
        Ok(input)
    }

    fn validate_resize_disk(&self, _guest: &Guest, _disk: &Disk, _new_size_mb: u64) -> Result<()> {
        unsupported(self.provider(), "validate_resize_disk")
    }

    // =========================================================================
    // Task Starters
    // =========================================================================

    async fn start_guest_create_task(
        &self,
        engine: &TaskEngine,
        request: GuestTaskRequest,
    ) -> Result<TaskHandle> {
        debug!(
            provider = self.provider(),
            workflow = %request.workflow,
            "Starting guest create task"
        );
        engine.start(request.into_new_task()).await
    }

    async fn start_delete_guest_task(
        &self,
        engine: &TaskEngine,
        request: GuestTaskRequest,
    ) -> Result<TaskHandle> {
        engine.start(request.into_new_task()).await
    }

    /// Decide how a deployed guest is brought to its first settled status
    fn on_guest_create_task_complete(&self, _guest: &Guest, params: &TaskParams) -> CreateFollowUp {
        if params.bool_param("auto_start", false) {
            CreateFollowUp::AutoStart
        } else {
            CreateFollowUp::SyncStatus
        }
    }

    // =========================================================================
    // Mutating Requests
    // =========================================================================

    async fn request_guest_create_all_disks(
        &self,
        _guest: &Guest,
        _disks: &[Disk],
        _task: &TaskHandle,
    ) -> Result<()> {
        unsupported(self.provider(), "request_guest_create_all_disks")
    }

    async fn request_create_disk(&self, _disk: &Disk, _task: &TaskHandle) -> Result<()> {
        unsupported(self.provider(), "request_create_disk")
    }

    async fn request_deploy_guest_on_host(
        &self,
        _guest: &Guest,
        _disks: &[Disk],
        _host: Option<&Host>,
        _task: &TaskHandle,
    ) -> Result<()> {
        unsupported(self.provider(), "request_deploy_guest_on_host")
    }

    async fn request_start_on_host(&self, _guest: &Guest, _task: &TaskHandle) -> Result<()> {
        unsupported(self.provider(), "request_start_on_host")
    }

    /// Report the recorded status back unchanged
    async fn request_sync_status(&self, guest: &Guest, task: &TaskHandle) -> Result<()> {
        task.schedule_run(Some(json!({ "status": guest.status })))
    }

    async fn request_detach_disk(&self, _guest: &Guest, _disk: &Disk, task: &TaskHandle) -> Result<()> {
        task.schedule_run(None)
    }

    async fn request_attach_disk(&self, _guest: &Guest, _disk: &Disk, _task: &TaskHandle) -> Result<()> {
        unsupported(self.provider(), "request_attach_disk")
    }

    async fn request_change_vm_config(
        &self,
        _guest: &Guest,
        _vcpu_count: u32,
        _vmem_size_mb: u64,
        _task: &TaskHandle,
    ) -> Result<()> {
        unsupported(self.provider(), "request_change_vm_config")
    }

    async fn request_rebuild_root_disk(
        &self,
        _guest: &Guest,
        _image_id: Option<&str>,
        _task: &TaskHandle,
    ) -> Result<()> {
        unsupported(self.provider(), "request_rebuild_root_disk")
    }

    async fn request_resize_disk(
        &self,
        _guest: &Guest,
        _disk: &Disk,
        _size_mb: u64,
        _task: &TaskHandle,
    ) -> Result<()> {
        unsupported(self.provider(), "request_resize_disk")
    }

    async fn request_detach_disks_from_guest_for_delete(
        &self,
        _guest: &Guest,
        task: &TaskHandle,
    ) -> Result<()> {
        task.schedule_run(None)
    }

    async fn request_undeploy_guest_on_host(&self, _guest: &Guest, _task: &TaskHandle) -> Result<()> {
        unsupported(self.provider(), "request_undeploy_guest_on_host")
    }

    async fn request_delete_detached_disk(
        &self,
        _disk: &Disk,
        _purge: bool,
        _task: &TaskHandle,
    ) -> Result<()> {
        unsupported(self.provider(), "request_delete_detached_disk")
    }

    async fn request_suspend_on_host(&self, _guest: &Guest, _task: &TaskHandle) -> Result<()> {
        unsupported(self.provider(), "request_suspend_on_host")
    }

    async fn request_guest_hot_add_iso(
        &self,
        _guest: &Guest,
        _iso: &str,
        _task: &TaskHandle,
    ) -> Result<()> {
        unsupported(self.provider(), "request_guest_hot_add_iso")
    }

    /// Drop the records of every disk the guest still owns
    async fn on_delete_guest_final_cleanup(&self, guest: &Guest, store: &GuestStoreRef) -> Result<()> {
        for disk_id in &guest.disks {
            if let Some(mut disk) = store.get_disk(disk_id).await? {
                disk.status = DiskStatus::Deleted;
                disk.guest_id = None;
                store.update_disk(disk).await?;
            }
        }
        Ok(())
    }
}

pub type GuestDriverRef = Arc<dyn GuestDriver>;

/// Reject `operation` unless the guest is in one of the `allowed` statuses
pub fn ensure_status(allowed: &[GuestStatus], guest: &Guest, operation: &str) -> Result<()> {
    if allowed.contains(&guest.status) {
        return Ok(());
    }
    Err(Error::InvalidState {
        resource: format!("guest/{}", guest.id),
        status: guest.status.to_string(),
        operation: operation.to_string(),
    })
}
