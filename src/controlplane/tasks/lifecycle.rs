//! Guest deletion

use super::GuestTaskDeps;
use crate::domain::model::GuestStatus;
use crate::error::Result;
use crate::task::engine::StageContext;
use crate::task::record::{ParamsExt, TaskError};
use crate::task::workflow::WorkflowHandler;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

crate::workflow_stages! {
    pub enum GuestDeleteStage {
        Init => "init",
        OnDisksDetached => "on_disks_detached",
        OnGuestUndeployed => "on_guest_undeployed" @ no_resume,
    }
}

pub struct GuestDeleteTask {
    deps: GuestTaskDeps,
}

impl GuestDeleteTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for GuestDeleteTask {
    type Stage = GuestDeleteStage;

    async fn on_stage(
        &self,
        stage: GuestDeleteStage,
        ctx: &mut StageContext<GuestDeleteStage>,
    ) -> Result<()> {
        let guest_id = ctx.target().id;
        match stage {
            GuestDeleteStage::Init => {
                let (guest, prev) = self
                    .deps
                    .enter_status(&guest_id, GuestStatus::Deleting)
                    .await?;
                let driver = self.deps.driver(&guest)?;

                ctx.set_stage(GuestDeleteStage::OnDisksDetached, Some(prev))
                    .await?;
                driver
                    .request_detach_disks_from_guest_for_delete(&guest, &ctx.handle())
                    .await
            }
            GuestDeleteStage::OnDisksDetached => {
                let guest = self.deps.target_guest(ctx).await?;
                let driver = self.deps.driver(&guest)?;

                ctx.set_stage(GuestDeleteStage::OnGuestUndeployed, None)
                    .await?;
                driver
                    .request_undeploy_guest_on_host(&guest, &ctx.handle())
                    .await
            }
            GuestDeleteStage::OnGuestUndeployed => {
                let mut guest = self.deps.target_guest(ctx).await?;
                let driver = self.deps.driver(&guest)?;
                driver
                    .on_delete_guest_final_cleanup(&guest, &self.deps.store)
                    .await?;

                guest.status = GuestStatus::Deleted;
                guest.external_id = None;
                guest.disks.clear();
                guest.updated_at = chrono::Utc::now();
                self.deps.store.update_guest(guest).await?;

                ctx.commit_reservation().await?;
                info!(
                    guest_id = %guest_id,
                    purge = ctx.params().bool_param("purge", false),
                    "Guest deleted"
                );
                ctx.complete(Some(json!({ "guest_id": guest_id })));
                Ok(())
            }
        }
    }

    async fn on_stage_failed(
        &self,
        _stage: GuestDeleteStage,
        ctx: &mut StageContext<GuestDeleteStage>,
        error: &TaskError,
    ) -> Result<()> {
        self.deps
            .mark_status(&ctx.target().id, GuestStatus::DeleteFailed)
            .await;
        ctx.fail(error.clone());
        Ok(())
    }
}
