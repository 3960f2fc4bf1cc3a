//! Guest Control Plane
//!
//! Composition of drivers, guest workflows, the task engine and the
//! orchestrator, plus the REST surface over them.

pub mod api;
pub mod orchestrator;
pub mod tasks;

pub use api::*;
pub use orchestrator::*;
pub use tasks::{register_guest_workflows, GuestTaskDeps};

use crate::domain::ports::GuestStoreRef;
use crate::drivers::{register_builtin, DriverEnvironment, DriverRegistry, DriverRegistryRef};
use crate::error::Result;
use crate::task::engine::{TaskEngine, TaskEngineBuilder};
use std::sync::Arc;
use tracing::info;

/// Everything a running control plane is made of
#[derive(Clone)]
pub struct ControlPlane {
    pub drivers: DriverRegistryRef,
    pub store: GuestStoreRef,
    pub engine: TaskEngine,
    pub orchestrator: Arc<GuestOrchestrator>,
}

impl ControlPlane {
    /// Registration phase: drivers first, then workflows, then the engine.
    /// Nothing is scheduled until the engine exists.
    pub fn assemble(
        env: &DriverEnvironment,
        enabled_providers: &[String],
        store: GuestStoreRef,
        mut engine: TaskEngineBuilder,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let mut drivers = DriverRegistry::builder();
        register_builtin(&mut drivers, env, enabled_providers);
        let drivers = drivers.build();

        let deps = GuestTaskDeps::new(drivers.clone(), store.clone());
        register_guest_workflows(&mut engine, &deps);
        let engine = engine.build()?;

        info!(
            drivers = drivers.registered().len(),
            workflows = engine.workflows().len(),
            "Control plane assembled"
        );

        let orchestrator =
            GuestOrchestrator::new(config, engine.clone(), drivers.clone(), store.clone());
        Ok(Self {
            drivers,
            store,
            engine,
            orchestrator,
        })
    }
}
