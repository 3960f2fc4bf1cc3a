//! Managed Backend Helper
//!
//! Shared by the public-cloud guest drivers. Every mutating request is
//! acknowledged immediately and executed out-of-band on the runtime under a
//! `StageRetry`; the outcome is delivered by re-scheduling the owning task
//! with the result as callback data, or by scheduling its failure.

use crate::domain::model::{Disk, Guest};
use crate::domain::ports::{workflows, ResourceRef, ServerCreateInput};
use crate::drivers::cloud::{CloudApiRef, DiskSpec, VmReport, VmSpec};
use crate::drivers::guest::GuestDriver;
use crate::error::{Error, Result};
use crate::task::engine::TaskHandle;
use crate::task::record::params;
use crate::task::retry::StageRetry;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use tracing::{debug, warn};

/// Runs provider calls on behalf of tasks
#[derive(Clone)]
pub struct ManagedBackend {
    cloud: CloudApiRef,
    retry: StageRetry,
}

impl ManagedBackend {
    pub fn new(cloud: CloudApiRef, retry: StageRetry) -> Self {
        Self { cloud, retry }
    }

    pub fn cloud(&self) -> &CloudApiRef {
        &self.cloud
    }

    /// Issue `call` out-of-band and report back to `task`
    pub fn spawn<T, F, Fut>(&self, task: &TaskHandle, operation: &'static str, call: F)
    where
        T: Serialize + Send + 'static,
        F: Fn(CloudApiRef) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let task = task.clone();
        let cloud = self.cloud.clone();
        let retry = self.retry.clone();

        debug!(
            task_id = %task.id(),
            provider = cloud.provider(),
            operation,
            "Scheduling backend call"
        );

        tokio::spawn(async move {
            let outcome = retry.run(operation, || call(cloud.clone())).await;
            let delivered = match outcome.and_then(|v| Ok(serde_json::to_value(v)?)) {
                Ok(value) => task.schedule_run(Some(value)),
                Err(e) => task.schedule_failed(&e),
            };
            if let Err(e) = delivered {
                warn!(
                    task_id = %task.id(),
                    operation,
                    "Backend result could not be delivered: {}",
                    e
                );
            }
        });
    }

    fn external_id(guest: &Guest, operation: &str) -> Result<String> {
        guest.external_id.clone().ok_or_else(|| Error::InvalidState {
            resource: format!("guest/{}", guest.id),
            status: guest.status.to_string(),
            operation: operation.to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // Disks
    // -------------------------------------------------------------------------

    /// One `DiskCreateTask` child per disk; the parent resumes when all report
    pub async fn create_all_disks(
        &self,
        guest: &Guest,
        disks: &[Disk],
        task: &TaskHandle,
    ) -> Result<()> {
        if disks.is_empty() {
            return task.schedule_run(None);
        }
        for disk in disks {
            task.new_child(
                workflows::DISK_CREATE_TASK,
                ResourceRef::disk(&disk.id),
                params(json!({ "guest_id": guest.id })),
                None,
            )
            .await?;
        }
        Ok(())
    }

    pub fn create_disk(&self, disk: &Disk, task: &TaskHandle) -> Result<()> {
        let spec = DiskSpec {
            name: disk.name.clone(),
            size_mb: disk.size_mb,
            backend: disk.backend.clone(),
        };
        self.spawn(task, "create_disk", move |cloud| {
            let spec = spec.clone();
            async move { cloud.create_disk(&spec).await }
        });
        Ok(())
    }

    pub fn resize_disk(&self, disk: &Disk, size_mb: u64, task: &TaskHandle) -> Result<()> {
        let Some(disk_id) = disk.external_id.clone() else {
            return Err(Error::ValidationFailed(format!(
                "disk {} has not been created on the backend",
                disk.id
            )));
        };
        self.spawn(task, "resize_disk", move |cloud| {
            let disk_id = disk_id.clone();
            async move { cloud.resize_disk(&disk_id, size_mb).await }
        });
        Ok(())
    }

    pub fn attach_disk(&self, guest: &Guest, disk: &Disk, task: &TaskHandle) -> Result<()> {
        let vm_id = Self::external_id(guest, "attach_disk")?;
        let Some(disk_id) = disk.external_id.clone() else {
            return Err(Error::ValidationFailed(format!(
                "disk {} has not been created on the backend",
                disk.id
            )));
        };
        self.spawn(task, "attach_disk", move |cloud| {
            let (vm_id, disk_id) = (vm_id.clone(), disk_id.clone());
            async move { cloud.attach_disk(&vm_id, &disk_id).await }
        });
        Ok(())
    }

    /// Detaching a disk the backend never saw is immediate
    pub fn detach_disk(&self, guest: &Guest, disk: &Disk, task: &TaskHandle) -> Result<()> {
        let (Some(vm_id), Some(disk_id)) = (guest.external_id.clone(), disk.external_id.clone())
        else {
            return task.schedule_run(None);
        };
        self.spawn(task, "detach_disk", move |cloud| {
            let (vm_id, disk_id) = (vm_id.clone(), disk_id.clone());
            async move { cloud.detach_disk(&vm_id, &disk_id).await }
        });
        Ok(())
    }

    pub fn delete_disk(&self, disk: &Disk, task: &TaskHandle) -> Result<()> {
        let Some(disk_id) = disk.external_id.clone() else {
            return task.schedule_run(None);
        };
        self.spawn(task, "delete_disk", move |cloud| {
            let disk_id = disk_id.clone();
            async move { cloud.delete_disk(&disk_id).await }
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Guests
    // -------------------------------------------------------------------------

    pub fn deploy(&self, guest: &Guest, disks: &[Disk], task: &TaskHandle) -> Result<()> {
        let mut disk_ids = Vec::with_capacity(disks.len());
        for disk in disks {
            let id = disk.external_id.clone().ok_or_else(|| {
                Error::ValidationFailed(format!("disk {} has not been created", disk.id))
            })?;
            disk_ids.push(id);
        }

        let spec = VmSpec {
            name: guest.name.clone(),
            vcpu_count: guest.vcpu_count,
            vmem_size_mb: guest.vmem_size_mb,
            image_id: guest.image_id.clone(),
            disk_ids,
        };
        self.spawn(task, "create_vm", move |cloud| {
            let spec = spec.clone();
            async move { cloud.create_vm(&spec).await.map(VmReport::from) }
        });
        Ok(())
    }

    pub fn start(&self, guest: &Guest, task: &TaskHandle) -> Result<()> {
        let vm_id = Self::external_id(guest, "start")?;
        self.spawn(task, "start_vm", move |cloud| {
            let vm_id = vm_id.clone();
            async move { cloud.start_vm(&vm_id).await.map(VmReport::from) }
        });
        Ok(())
    }

    /// A guest that never reached the backend keeps its recorded status
    pub fn sync_status(&self, guest: &Guest, task: &TaskHandle) -> Result<()> {
        let Some(vm_id) = guest.external_id.clone() else {
            return task.schedule_run(Some(json!({ "status": guest.status })));
        };
        self.spawn(task, "vm_status", move |cloud| {
            let vm_id = vm_id.clone();
            async move { cloud.vm_status(&vm_id).await.map(VmReport::from) }
        });
        Ok(())
    }

    pub fn change_config(
        &self,
        guest: &Guest,
        vcpu_count: u32,
        vmem_size_mb: u64,
        task: &TaskHandle,
    ) -> Result<()> {
        let vm_id = Self::external_id(guest, "change_config")?;
        self.spawn(task, "change_vm_config", move |cloud| {
            let vm_id = vm_id.clone();
            async move {
                cloud
                    .change_vm_config(&vm_id, vcpu_count, vmem_size_mb)
                    .await
                    .map(VmReport::from)
            }
        });
        Ok(())
    }

    pub fn rebuild_root(
        &self,
        guest: &Guest,
        image_id: Option<&str>,
        task: &TaskHandle,
    ) -> Result<()> {
        let vm_id = Self::external_id(guest, "rebuild_root")?;
        let image_id = image_id.map(str::to_string);
        self.spawn(task, "rebuild_root", move |cloud| {
            let (vm_id, image_id) = (vm_id.clone(), image_id.clone());
            async move {
                cloud
                    .rebuild_root(&vm_id, image_id.as_deref())
                    .await
                    .map(VmReport::from)
            }
        });
        Ok(())
    }

    /// A guest that never reached the backend has nothing to undeploy
    pub fn undeploy(&self, guest: &Guest, task: &TaskHandle) -> Result<()> {
        let Some(vm_id) = guest.external_id.clone() else {
            return task.schedule_run(None);
        };
        self.spawn(task, "delete_vm", move |cloud| {
            let vm_id = vm_id.clone();
            async move { cloud.delete_vm(&vm_id).await }
        });
        Ok(())
    }
}

// =============================================================================
// Shared Validation
// =============================================================================

/// Disk checks shared by managed drivers: default backends, supported
/// storage types, the minimal system disk, and per-backend size ranges
pub fn validate_managed_disks(
    driver: &dyn GuestDriver,
    mut input: ServerCreateInput,
) -> Result<ServerCreateInput> {
    if input.disks.is_empty() {
        return Err(Error::ValidationFailed("a system disk is required".into()));
    }

    for (i, disk) in input.disks.iter_mut().enumerate() {
        let backend = disk
            .backend
            .get_or_insert_with(|| driver.default_sys_disk_backend().to_string())
            .clone();

        if !driver.storage_types().contains(&backend.as_str()) {
            return Err(Error::ValidationFailed(format!(
                "storage type {} is not supported by {}",
                backend,
                driver.provider()
            )));
        }

        let size_gb = disk.size_mb / 1024;
        if i == 0 && disk.size_mb < driver.minimal_sys_disk_size_gb() * 1024 {
            return Err(Error::ValidationFailed(format!(
                "the system disk must be at least {}GB",
                driver.minimal_sys_disk_size_gb()
            )));
        }
        if let Some(range) = driver.disk_size_range_gb(&backend) {
            if disk.size_mb < range.start() * 1024 || disk.size_mb > range.end() * 1024 {
                return Err(Error::ValidationFailed(format!(
                    "the {} disk size must be in the range of {}GB ~ {}GB, got {}GB",
                    backend,
                    range.start(),
                    range.end(),
                    size_gb
                )));
            }
        }
    }

    Ok(input)
}
