//! Baremetal to hypervisor conversion

use super::GuestTaskDeps;
use crate::domain::model::HostType;
use crate::domain::ports::{workflows, ResourceRef};
use crate::error::{Error, Result};
use crate::task::engine::StageContext;
use crate::task::record::{ParamsExt, TaskParams};
use crate::task::workflow::WorkflowHandler;
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

crate::workflow_stages! {
    pub enum ConvertStage {
        Init => "init",
        OnGuestDeployed => "on_guest_deployed",
    }
}

/// Deploys a hypervisor guest onto a baremetal host, then flips the host type
pub struct BaremetalConvertHypervisorTask {
    deps: GuestTaskDeps,
}

impl BaremetalConvertHypervisorTask {
    pub fn new(deps: GuestTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl WorkflowHandler for BaremetalConvertHypervisorTask {
    type Stage = ConvertStage;

    async fn on_stage(&self, stage: ConvertStage, ctx: &mut StageContext<ConvertStage>) -> Result<()> {
        let host_id = ctx.target().id;
        match stage {
            ConvertStage::Init => {
                let host = self.deps.store.require_host(&host_id).await?;
                if !host.is_baremetal() {
                    return Err(Error::InvalidState {
                        resource: format!("host/{}", host.id),
                        status: "hypervisor".into(),
                        operation: "convert".into(),
                    });
                }

                let params = ctx.params();
                let server_id = params.require_str("server_id")?.to_string();
                let server_params: TaskParams =
                    params.typed("server_params")?.unwrap_or_default();
                self.deps.store.require_guest(&server_id).await?;

                let reservation = ctx.take_reservation().await?;
                ctx.set_stage(ConvertStage::OnGuestDeployed, None).await?;
                let spawned = ctx
                    .spawn_child(
                        workflows::GUEST_CREATE_TASK,
                        ResourceRef::guest(&server_id),
                        server_params,
                        reservation.clone(),
                    )
                    .await;

                if let Err(e) = spawned {
                    // The child never took ownership
                    if let Some(reservation) = reservation {
                        if let Err(cancel) = ctx.handle().engine().quota().cancel(&reservation.id) {
                            warn!(reservation_id = %reservation.id, "Failed to release reservation: {}", cancel);
                        }
                    }
                    return Err(e);
                }
                Ok(())
            }
            ConvertStage::OnGuestDeployed => {
                if ctx.outstanding_children() > 0 {
                    return Ok(());
                }

                let mut host = self.deps.store.require_host(&host_id).await?;
                host.host_type = HostType::Hypervisor;
                self.deps.store.update_host(host).await?;
                info!(host_id = %host_id, "Baremetal host converted to hypervisor");

                ctx.complete(Some(json!({
                    "host_id": host_id,
                    "server_id": ctx.params().str_param("server_id"),
                })));
                Ok(())
            }
        }
    }
}
