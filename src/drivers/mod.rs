//! Capability Drivers
//!
//! Provider plug-ins behind the `GuestDriver` and `ProviderDriver`
//! capability traits, the registry that maps (resource kind, provider) to
//! them, and the cloud backend port the managed drivers call.

pub mod aliyun;
pub mod azure;
pub mod cloud;
pub mod guest;
pub mod managed;
pub mod provider;
pub mod qcloud;
pub mod registry;

pub use cloud::{CloudApi, CloudApiRef, DiskInfo, SimulatedCloud, VmInfo, VmReport};
pub use guest::{CreateFollowUp, GuestDriver, GuestDriverRef, GuestTaskRequest};
pub use managed::ManagedBackend;
pub use provider::{ProviderDriver, ProviderDriverRef};
pub use registry::{DriverRef, DriverRegistry, DriverRegistryBuilder, DriverRegistryRef};

use crate::domain::ports::providers;
use crate::task::retry::StageRetry;
use std::collections::BTreeMap;
use tracing::warn;

/// Backends and retry policy handed to the built-in plug-ins
#[derive(Clone)]
pub struct DriverEnvironment {
    clouds: BTreeMap<String, CloudApiRef>,
    pub retry: StageRetry,
}

impl DriverEnvironment {
    pub fn new(retry: StageRetry) -> Self {
        Self {
            clouds: BTreeMap::new(),
            retry,
        }
    }

    /// Environment with a simulated backend for every built-in provider
    pub fn simulated(retry: StageRetry, latency: std::time::Duration) -> Self {
        let mut env = Self::new(retry);
        for provider in [providers::ALIYUN, providers::AZURE] {
            env = env.with_cloud(SimulatedCloud::with_latency(provider, latency));
        }
        env
    }

    pub fn with_cloud(mut self, cloud: CloudApiRef) -> Self {
        self.clouds.insert(cloud.provider().to_string(), cloud);
        self
    }

    pub fn cloud(&self, provider: &str) -> Option<&CloudApiRef> {
        self.clouds.get(provider)
    }
}

/// Register the built-in plug-ins named in `enabled`, in a fixed order.
/// Guest drivers without a backend in `env` are skipped.
pub fn register_builtin(
    builder: &mut DriverRegistryBuilder,
    env: &DriverEnvironment,
    enabled: &[String],
) {
    let wants = |p: &str| enabled.iter().any(|e| e == p);

    if wants(providers::ALIYUN) {
        match env.cloud(providers::ALIYUN) {
            Some(cloud) => aliyun::register(builder, cloud.clone(), env.retry.clone()),
            None => warn!(provider = providers::ALIYUN, "No backend configured, driver skipped"),
        }
    }
    if wants(providers::AZURE) {
        match env.cloud(providers::AZURE) {
            Some(cloud) => azure::register(builder, cloud.clone(), env.retry.clone()),
            None => warn!(provider = providers::AZURE, "No backend configured, driver skipped"),
        }
    }
    if wants(providers::QCLOUD) {
        qcloud::register(builder);
    }
}
