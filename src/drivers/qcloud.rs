//! Qcloud Cloud Account Driver

use crate::domain::ports::providers;
use crate::drivers::provider::ProviderDriver;
use crate::drivers::registry::DriverRegistryBuilder;
use std::sync::Arc;

pub struct QcloudProviderDriver;

impl ProviderDriver for QcloudProviderDriver {
    fn provider(&self) -> &'static str {
        providers::QCLOUD
    }
}

pub fn register(builder: &mut DriverRegistryBuilder) {
    builder.register_provider_driver(Arc::new(QcloudProviderDriver));
}
