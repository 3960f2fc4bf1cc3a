//! Guest creation: disks, deploy, then start or status sync

use super::GuestTaskDeps;
use crate::domain::model::{DiskStatus, GuestStatus};
use crate::domain::ports::{workflows, ResourceRef};
use crate::drivers::{CreateFollowUp, DiskInfo, VmReport};
use crate::error::{Error, Result};
use crate::task::engine::StageContext;
use crate::task::record::{ParamsExt, TaskError, TaskParams};
use crate::task::workflow::{WorkflowHandler, WorkflowStage};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

// =============================================================================
// GuestCreateTask
// =============================================================================

crate::workflow_stages! {
    pub enum GuestCreateStage {
        Init => "init",
        OnDiskPrepared => "on_disk_prepared",
        OnDeployComplete => "on_deploy_complete" @ no_resume,
        OnAutoStartGuest => "on_auto_start_guest",
        OnSyncStatusComplete => "on_sync_status_complete",
    }
}

pub struct GuestCreateTask {
    deps: GuestTaskDeps,
}

impl GuestCreateTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for GuestCreateTask {
    type Stage = GuestCreateStage;

    async fn on_stage(
        &self,
        stage: GuestCreateStage,
        ctx: &mut StageContext<GuestCreateStage>,
    ) -> Result<()> {
        let guest_id = ctx.target().id;
        match stage {
            GuestCreateStage::Init => {
                let guest = self
                    .deps
                    .store
                    .set_guest_status(&guest_id, GuestStatus::Creating)
                    .await?;
                let driver = self.deps.driver(&guest)?;
                let disks = self.deps.disks_of(&guest).await?;

                ctx.set_stage(GuestCreateStage::OnDiskPrepared, None).await?;
                driver
                    .request_guest_create_all_disks(&guest, &disks, &ctx.handle())
                    .await
            }
            GuestCreateStage::OnDiskPrepared => {
                if ctx.outstanding_children() > 0 {
                    return Ok(());
                }

                let guest = self
                    .deps
                    .store
                    .set_guest_status(&guest_id, GuestStatus::Deploying)
                    .await?;
                let driver = self.deps.driver(&guest)?;
                let disks = self.deps.disks_of(&guest).await?;
                let host = match &guest.host_id {
                    Some(host_id) => self.deps.store.get_host(host_id).await?,
                    None => None,
                };

                ctx.set_stage(GuestCreateStage::OnDeployComplete, None).await?;
                driver
                    .request_deploy_guest_on_host(&guest, &disks, host.as_ref(), &ctx.handle())
                    .await
            }
            GuestCreateStage::OnDeployComplete => {
                let report = VmReport::from_data(&ctx.data())?;
                let mut guest = self.deps.store.require_guest(&guest_id).await?;
                let driver = self.deps.driver(&guest)?;

                guest.external_id = Some(report.external_id.clone());
                guest.status = driver.guest_initial_state_after_create();
                guest.vcpu_count = report.vcpu_count;
                guest.vmem_size_mb = report.vmem_size_mb;
                guest.updated_at = chrono::Utc::now();
                self.deps.store.update_guest(guest.clone()).await?;

                // Usage is real once the backend holds the guest
                ctx.commit_reservation().await?;
                info!(guest_id = %guest_id, external_id = %report.external_id, "Guest deployed");

                let (next, workflow) = match driver.on_guest_create_task_complete(&guest, &ctx.params()) {
                    CreateFollowUp::AutoStart => {
                        (GuestCreateStage::OnAutoStartGuest, workflows::GUEST_START_TASK)
                    }
                    CreateFollowUp::SyncStatus => (
                        GuestCreateStage::OnSyncStatusComplete,
                        workflows::GUEST_SYNCSTATUS_TASK,
                    ),
                };
                ctx.set_stage(next, None).await?;
                ctx.spawn_child(workflow, ResourceRef::guest(&guest_id), TaskParams::new(), None)
                    .await?;
                Ok(())
            }
            GuestCreateStage::OnAutoStartGuest | GuestCreateStage::OnSyncStatusComplete => {
                let guest = self.deps.store.require_guest(&guest_id).await?;
                ctx.complete(Some(json!({
                    "guest_id": guest.id,
                    "status": guest.status,
                })));
                Ok(())
            }
        }
    }

    async fn on_stage_failed(
        &self,
        stage: GuestCreateStage,
        ctx: &mut StageContext<GuestCreateStage>,
        error: &TaskError,
    ) -> Result<()> {
        // A deployed guest keeps whatever status its start/sync left behind
        if stage.position() <= GuestCreateStage::OnDeployComplete.position() {
            self.deps
                .mark_status(&ctx.target().id, GuestStatus::CreateFailed)
                .await;
        }
        ctx.fail(error.clone());
        Ok(())
    }
}

// =============================================================================
// DiskCreateTask
// =============================================================================

crate::workflow_stages! {
    pub enum DiskCreateStage {
        Init => "init",
        OnDiskReady => "on_disk_ready" @ no_resume,
    }
}

pub struct DiskCreateTask {
    deps: GuestTaskDeps,
}

impl DiskCreateTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for DiskCreateTask {
    type Stage = DiskCreateStage;

    async fn on_stage(
        &self,
        stage: DiskCreateStage,
        ctx: &mut StageContext<DiskCreateStage>,
    ) -> Result<()> {
        let disk_id = ctx.target().id;
        let store = &self.deps.store;
        match stage {
            DiskCreateStage::Init => {
                let guest = store.require_guest(ctx.params().require_str("guest_id")?).await?;
                let driver = self.deps.driver(&guest)?;

                let mut disk = store.require_disk(&disk_id).await?;
                disk.status = DiskStatus::Creating;
                store.update_disk(disk.clone()).await?;

                ctx.set_stage(DiskCreateStage::OnDiskReady, None).await?;
                driver.request_create_disk(&disk, &ctx.handle()).await
            }
            DiskCreateStage::OnDiskReady => {
                let info = DiskInfo::from_data(&ctx.data())?;
                let guest_id = ctx.params().require_str("guest_id")?.to_string();

                let mut disk = store.require_disk(&disk_id).await?;
                disk.external_id = Some(info.external_id.clone());
                disk.size_mb = info.size_mb;
                disk.status = DiskStatus::Ready;
                disk.guest_id = Some(guest_id);
                store.update_disk(disk).await?;

                ctx.complete(Some(json!({
                    "disk_id": disk_id,
                    "external_id": info.external_id,
                })));
                Ok(())
            }
        }
    }

    async fn on_stage_failed(
        &self,
        _stage: DiskCreateStage,
        ctx: &mut StageContext<DiskCreateStage>,
        error: &TaskError,
    ) -> Result<()> {
        self.deps
            .mark_disk_status(&ctx.target().id, DiskStatus::Failed)
            .await;
        ctx.fail(error.clone());
        Ok(())
    }
}

// =============================================================================
// GuestStartTask
// =============================================================================

crate::workflow_stages! {
    pub enum GuestStartStage {
        Init => "init",
        OnStartComplete => "on_start_complete" @ no_resume,
    }
}

pub struct GuestStartTask {
    deps: GuestTaskDeps,
}

impl GuestStartTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for GuestStartTask {
    type Stage = GuestStartStage;

    async fn on_stage(
        &self,
        stage: GuestStartStage,
        ctx: &mut StageContext<GuestStartStage>,
    ) -> Result<()> {
        let guest_id = ctx.target().id;
        match stage {
            GuestStartStage::Init => {
                let (guest, prev) = self
                    .deps
                    .enter_status(&guest_id, GuestStatus::Starting)
                    .await?;
                let driver = self.deps.driver(&guest)?;

                ctx.set_stage(GuestStartStage::OnStartComplete, Some(prev))
                    .await?;
                driver.request_start_on_host(&guest, &ctx.handle()).await
            }
            GuestStartStage::OnStartComplete => {
                let report = VmReport::from_data(&ctx.data())?;
                let guest = self
                    .deps
                    .store
                    .set_guest_status(&guest_id, report.status)
                    .await?;
                ctx.complete(Some(json!({ "status": guest.status })));
                Ok(())
            }
        }
    }

    async fn on_stage_failed(
        &self,
        _stage: GuestStartStage,
        ctx: &mut StageContext<GuestStartStage>,
        error: &TaskError,
    ) -> Result<()> {
        self.deps.restore_status(ctx, &ctx.target().id).await;
        ctx.fail(error.clone());
        Ok(())
    }
}

// =============================================================================
// GuestSyncstatusTask
// =============================================================================

crate::workflow_stages! {
    pub enum GuestSyncstatusStage {
        Init => "init",
        OnSyncComplete => "on_sync_complete" @ no_resume,
    }
}

pub struct GuestSyncstatusTask {
    deps: GuestTaskDeps,
}

impl GuestSyncstatusTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for GuestSyncstatusTask {
    type Stage = GuestSyncstatusStage;

    async fn on_stage(
        &self,
        stage: GuestSyncstatusStage,
        ctx: &mut StageContext<GuestSyncstatusStage>,
    ) -> Result<()> {
        let guest_id = ctx.target().id;
        match stage {
            GuestSyncstatusStage::Init => {
                let guest = self.deps.store.require_guest(&guest_id).await?;
                let driver = self.deps.driver(&guest)?;

                ctx.set_stage(GuestSyncstatusStage::OnSyncComplete, None)
                    .await?;
                driver.request_sync_status(&guest, &ctx.handle()).await
            }
            GuestSyncstatusStage::OnSyncComplete => {
                let status: GuestStatus = ctx.data().typed("status")?.ok_or_else(|| {
                    Error::ValidationFailed("sync result carries no status".into())
                })?;
                self.deps.store.set_guest_status(&guest_id, status).await?;
                ctx.complete(Some(json!({ "status": status })));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_stages_are_not_resumable() {
        assert!(GuestCreateStage::OnDiskPrepared.resumable());
        assert!(!GuestCreateStage::OnDeployComplete.resumable());
        assert!(!DiskCreateStage::OnDiskReady.resumable());
        assert_eq!(GuestCreateStage::all()[0].as_str(), "init");
    }
}
