//! Reconfiguration of a live guest: config, disks, root image

use super::GuestTaskDeps;
use crate::domain::model::{DiskStatus, GuestStatus};
use crate::domain::ports::{workflows, ResourceRef};
use crate::drivers::{DiskInfo, VmReport};
use crate::error::{Error, Result};
use crate::task::engine::StageContext;
use crate::task::record::{ParamsExt, TaskError, TaskParams};
use crate::task::workflow::WorkflowHandler;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

// =============================================================================
// GuestChangeConfigTask
// =============================================================================

crate::workflow_stages! {
    pub enum ChangeConfigStage {
        Init => "init",
        OnConfigChanged => "on_config_changed" @ no_resume,
        OnSyncStatusComplete => "on_sync_status_complete",
    }
}

pub struct GuestChangeConfigTask {
    deps: GuestTaskDeps,
}

impl GuestChangeConfigTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for GuestChangeConfigTask {
    type Stage = ChangeConfigStage;

    async fn on_stage(
        &self,
        stage: ChangeConfigStage,
        ctx: &mut StageContext<ChangeConfigStage>,
    ) -> Result<()> {
        let guest_id = ctx.target().id;
        match stage {
            ChangeConfigStage::Init => {
                let params = ctx.params();
                let vcpu_count = u32::try_from(params.require_u64("vcpu_count")?)
                    .map_err(|_| Error::ValidationFailed("vcpu_count out of range".into()))?;
                let vmem_size_mb = params.require_u64("vmem_size_mb")?;

                let (guest, prev) = self
                    .deps
                    .enter_status(&guest_id, GuestStatus::ChangingConfig)
                    .await?;
                let driver = self.deps.driver(&guest)?;

                ctx.set_stage(ChangeConfigStage::OnConfigChanged, Some(prev))
                    .await?;
                driver
                    .request_change_vm_config(&guest, vcpu_count, vmem_size_mb, &ctx.handle())
                    .await
            }
            ChangeConfigStage::OnConfigChanged => {
                let report = VmReport::from_data(&ctx.data())?;
                let mut guest = self.deps.target_guest(ctx).await?;
                guest.vcpu_count = report.vcpu_count;
                guest.vmem_size_mb = report.vmem_size_mb;
                guest.updated_at = chrono::Utc::now();
                self.deps.store.update_guest(guest).await?;

                ctx.commit_reservation().await?;
                ctx.set_stage(ChangeConfigStage::OnSyncStatusComplete, None)
                    .await?;
                ctx.spawn_child(
                    workflows::GUEST_SYNCSTATUS_TASK,
                    ResourceRef::guest(&guest_id),
                    TaskParams::new(),
                    None,
                )
                .await?;
                Ok(())
            }
            ChangeConfigStage::OnSyncStatusComplete => {
                let guest = self.deps.target_guest(ctx).await?;
                ctx.complete(Some(json!({
                    "vcpu_count": guest.vcpu_count,
                    "vmem_size_mb": guest.vmem_size_mb,
                })));
                Ok(())
            }
        }
    }

    async fn on_stage_failed(
        &self,
        _stage: ChangeConfigStage,
        ctx: &mut StageContext<ChangeConfigStage>,
        error: &TaskError,
    ) -> Result<()> {
        self.deps.restore_status(ctx, &ctx.target().id).await;
        ctx.fail(error.clone());
        Ok(())
    }
}

// =============================================================================
// DiskResizeTask
// =============================================================================

crate::workflow_stages! {
    pub enum DiskResizeStage {
        Init => "init",
        OnDiskResized => "on_disk_resized" @ no_resume,
    }
}

pub struct DiskResizeTask {
    deps: GuestTaskDeps,
}

impl DiskResizeTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for DiskResizeTask {
    type Stage = DiskResizeStage;

    async fn on_stage(
        &self,
        stage: DiskResizeStage,
        ctx: &mut StageContext<DiskResizeStage>,
    ) -> Result<()> {
        let disk_id = ctx.target().id;
        let params = ctx.params();
        let guest_id = params.require_str("guest_id")?.to_string();
        let store = &self.deps.store;

        match stage {
            DiskResizeStage::Init => {
                let size_mb = params.require_u64("size_mb")?;
                let (guest, prev) = self
                    .deps
                    .enter_status(&guest_id, GuestStatus::ResizingDisk)
                    .await?;
                let driver = self.deps.driver(&guest)?;

                let mut disk = store.require_disk(&disk_id).await?;
                disk.status = DiskStatus::Resizing;
                store.update_disk(disk.clone()).await?;

                ctx.set_stage(DiskResizeStage::OnDiskResized, Some(prev))
                    .await?;
                driver
                    .request_resize_disk(&guest, &disk, size_mb, &ctx.handle())
                    .await
            }
            DiskResizeStage::OnDiskResized => {
                let info = DiskInfo::from_data(&ctx.data())?;
                let mut disk = store.require_disk(&disk_id).await?;
                disk.size_mb = info.size_mb;
                disk.status = DiskStatus::Ready;
                store.update_disk(disk).await?;
                self.deps.restore_status(ctx, &guest_id).await;

                ctx.commit_reservation().await?;
                ctx.complete(Some(json!({ "disk_id": disk_id, "size_mb": info.size_mb })));
                Ok(())
            }
        }
    }

    async fn on_stage_failed(
        &self,
        _stage: DiskResizeStage,
        ctx: &mut StageContext<DiskResizeStage>,
        error: &TaskError,
    ) -> Result<()> {
        self.deps
            .mark_disk_status(&ctx.target().id, DiskStatus::Ready)
            .await;
        if let Some(guest_id) = ctx.params().str_param("guest_id") {
            self.deps.restore_status(ctx, guest_id).await;
        }
        ctx.fail(error.clone());
        Ok(())
    }
}

// =============================================================================
// GuestRebuildRootTask
// =============================================================================

crate::workflow_stages! {
    pub enum RebuildRootStage {
        Init => "init",
        OnRebuildRootComplete => "on_rebuild_root_complete" @ no_resume,
    }
}

pub struct GuestRebuildRootTask {
    deps: GuestTaskDeps,
}

impl GuestRebuildRootTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for GuestRebuildRootTask {
    type Stage = RebuildRootStage;

    async fn on_stage(
        &self,
        stage: RebuildRootStage,
        ctx: &mut StageContext<RebuildRootStage>,
    ) -> Result<()> {
        let guest_id = ctx.target().id;
        match stage {
            RebuildRootStage::Init => {
                let image_id = ctx.params().str_param("image_id").map(str::to_string);
                let (guest, prev) = self
                    .deps
                    .enter_status(&guest_id, GuestStatus::Rebuilding)
                    .await?;
                let driver = self.deps.driver(&guest)?;

                ctx.set_stage(RebuildRootStage::OnRebuildRootComplete, Some(prev))
                    .await?;
                driver
                    .request_rebuild_root_disk(&guest, image_id.as_deref(), &ctx.handle())
                    .await
            }
            RebuildRootStage::OnRebuildRootComplete => {
                let report = VmReport::from_data(&ctx.data())?;
                let mut guest = self.deps.target_guest(ctx).await?;
                let driver = self.deps.driver(&guest)?;

                guest.image_id = report.image_id.or(guest.image_id);
                guest.status = driver.guest_initial_state_after_rebuild();
                guest.updated_at = chrono::Utc::now();
                self.deps.store.update_guest(guest.clone()).await?;

                ctx.complete(Some(json!({
                    "image_id": guest.image_id,
                    "status": guest.status,
                })));
                Ok(())
            }
        }
    }

    async fn on_stage_failed(
        &self,
        _stage: RebuildRootStage,
        ctx: &mut StageContext<RebuildRootStage>,
        error: &TaskError,
    ) -> Result<()> {
        self.deps.restore_status(ctx, &ctx.target().id).await;
        ctx.fail(error.clone());
        Ok(())
    }
}

// =============================================================================
// GuestDetachDiskTask
// =============================================================================

crate::workflow_stages! {
    pub enum DetachDiskStage {
        Init => "init",
        OnDiskDetached => "on_disk_detached" @ no_resume,
        OnDetachedDiskDeleted => "on_detached_disk_deleted" @ no_resume,
    }
}

pub struct GuestDetachDiskTask {
    deps: GuestTaskDeps,
}

impl GuestDetachDiskTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for GuestDetachDiskTask {
    type Stage = DetachDiskStage;

    async fn on_stage(
        &self,
        stage: DetachDiskStage,
        ctx: &mut StageContext<DetachDiskStage>,
    ) -> Result<()> {
        let guest_id = ctx.target().id;
        let params = ctx.params();
        let disk_id = params.require_str("disk_id")?.to_string();
        let store = &self.deps.store;

        match stage {
            DetachDiskStage::Init => {
                let (guest, prev) = self
                    .deps
                    .enter_status(&guest_id, GuestStatus::DetachingDisk)
                    .await?;
                let driver = self.deps.driver(&guest)?;

                let mut disk = store.require_disk(&disk_id).await?;
                disk.status = DiskStatus::Detaching;
                store.update_disk(disk.clone()).await?;

                ctx.set_stage(DetachDiskStage::OnDiskDetached, Some(prev))
                    .await?;
                driver
                    .request_detach_disk(&guest, &disk, &ctx.handle())
                    .await
            }
            DetachDiskStage::OnDiskDetached => {
                let mut guest = self.deps.target_guest(ctx).await?;
                let driver = self.deps.driver(&guest)?;
                guest.disks.retain(|d| d != &disk_id);
                if let Ok(Some(prev)) = params.typed::<GuestStatus>("prev_status") {
                    guest.status = prev;
                }
                guest.updated_at = chrono::Utc::now();
                store.update_guest(guest).await?;

                let mut disk = store.require_disk(&disk_id).await?;
                disk.guest_id = None;
                disk.status = DiskStatus::Ready;
                store.update_disk(disk.clone()).await?;

                if params.bool_param("keep_disk", false) {
                    ctx.complete(Some(json!({ "disk_id": disk_id, "kept": true })));
                    return Ok(());
                }

                ctx.set_stage(DetachDiskStage::OnDetachedDiskDeleted, None)
                    .await?;
                let purge = params.bool_param("purge", false);
                match driver
                    .request_delete_detached_disk(&disk, purge, &ctx.handle())
                    .await
                {
                    Err(e) if e.is_not_implemented() => {
                        info!(disk_id = %disk_id, "Driver cannot delete detached disks, keeping it");
                        ctx.complete(Some(json!({ "disk_id": disk_id, "kept": true })));
                        Ok(())
                    }
                    other => other,
                }
            }
            DetachDiskStage::OnDetachedDiskDeleted => {
                let mut disk = store.require_disk(&disk_id).await?;
                disk.status = DiskStatus::Deleted;
                store.update_disk(disk).await?;
                ctx.complete(Some(json!({ "disk_id": disk_id, "kept": false })));
                Ok(())
            }
        }
    }

    async fn on_stage_failed(
        &self,
        stage: DetachDiskStage,
        ctx: &mut StageContext<DetachDiskStage>,
        error: &TaskError,
    ) -> Result<()> {
        if stage != DetachDiskStage::OnDetachedDiskDeleted {
            self.deps.restore_status(ctx, &ctx.target().id).await;
            if let Some(disk_id) = ctx.params().str_param("disk_id") {
                self.deps.mark_disk_status(disk_id, DiskStatus::Ready).await;
            }
        }
        ctx.fail(error.clone());
        Ok(())
    }
}

// =============================================================================
// GuestAttachDiskTask
// =============================================================================

crate::workflow_stages! {
    pub enum AttachDiskStage {
        Init => "init",
        OnDiskAttached => "on_disk_attached" @ no_resume,
    }
}

pub struct GuestAttachDiskTask {
    deps: GuestTaskDeps,
}

impl GuestAttachDiskTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for GuestAttachDiskTask {
    type Stage = AttachDiskStage;

    async fn on_stage(
        &self,
        stage: AttachDiskStage,
        ctx: &mut StageContext<AttachDiskStage>,
    ) -> Result<()> {
        let guest_id = ctx.target().id;
        let params = ctx.params();
        let disk_id = params.require_str("disk_id")?.to_string();
        let store = &self.deps.store;

        match stage {
            AttachDiskStage::Init => {
                let (guest, prev) = self
                    .deps
                    .enter_status(&guest_id, GuestStatus::AttachingDisk)
                    .await?;
                let driver = self.deps.driver(&guest)?;
                let disk = store.require_disk(&disk_id).await?;

                ctx.set_stage(AttachDiskStage::OnDiskAttached, Some(prev))
                    .await?;
                driver
                    .request_attach_disk(&guest, &disk, &ctx.handle())
                    .await
            }
            AttachDiskStage::OnDiskAttached => {
                let mut disk = store.require_disk(&disk_id).await?;
                disk.guest_id = Some(guest_id.clone());
                store.update_disk(disk).await?;

                let mut guest = self.deps.target_guest(ctx).await?;
                if !guest.disks.contains(&disk_id) {
                    guest.disks.push(disk_id.clone());
                }
                if let Ok(Some(prev)) = params.typed::<GuestStatus>("prev_status") {
                    guest.status = prev;
                }
                guest.updated_at = chrono::Utc::now();
                store.update_guest(guest).await?;

                ctx.complete(Some(json!({ "disk_id": disk_id })));
                Ok(())
            }
        }
    }

    async fn on_stage_failed(
        &self,
        _stage: AttachDiskStage,
        ctx: &mut StageContext<AttachDiskStage>,
        error: &TaskError,
    ) -> Result<()> {
        self.deps.restore_status(ctx, &ctx.target().id).await;
        ctx.fail(error.clone());
        Ok(())
    }
}
