//! Azure Guest Driver
//!
//! Disk operations are only accepted while the guest is stopped. Root disk
//! rebuild and prepaid billing are not offered.

use crate::domain::model::{Disk, Guest, GuestStatus, Host};
use crate::domain::ports::{providers, storage, Credential, ServerCreateInput};
use crate::drivers::cloud::CloudApiRef;
use crate::drivers::guest::{ensure_status, GuestDriver};
use crate::drivers::managed::{validate_managed_disks, ManagedBackend};
use crate::drivers::registry::DriverRegistryBuilder;
use crate::error::{Error, Result};
use crate::task::engine::TaskHandle;
use crate::task::retry::StageRetry;
use async_trait::async_trait;
use std::ops::RangeInclusive;
use std::sync::Arc;

const STORAGE_TYPES: &[&str] = &[
    storage::STANDARD_LRS,
    storage::PREMIUM_LRS,
    storage::STANDARDSSD_LRS,
];

pub struct AzureGuestDriver {
    backend: ManagedBackend,
}

impl AzureGuestDriver {
    pub fn new(cloud: CloudApiRef, retry: StageRetry) -> Self {
        Self {
            backend: ManagedBackend::new(cloud, retry),
        }
    }
}

pub fn register(builder: &mut DriverRegistryBuilder, cloud: CloudApiRef, retry: StageRetry) {
    builder.register_guest_driver(Arc::new(AzureGuestDriver::new(cloud, retry)));
}

#[async_trait]
impl GuestDriver for AzureGuestDriver {
    fn provider(&self) -> &'static str {
        providers::AZURE
    }

    fn default_sys_disk_backend(&self) -> &'static str {
        storage::STANDARD_LRS
    }

    fn minimal_sys_disk_size_gb(&self) -> u64 {
        30
    }

    fn storage_types(&self) -> &'static [&'static str] {
        STORAGE_TYPES
    }

    fn disk_size_range_gb(&self, backend: &str) -> Option<RangeInclusive<u64>> {
        STORAGE_TYPES.contains(&backend).then_some(1..=4095)
    }

    fn detach_disk_status(&self) -> Result<Vec<GuestStatus>> {
        Ok(vec![GuestStatus::Ready])
    }

    fn attach_disk_status(&self) -> Result<Vec<GuestStatus>> {
        Ok(vec![GuestStatus::Ready])
    }

    fn change_config_status(&self) -> Result<Vec<GuestStatus>> {
        Ok(vec![GuestStatus::Ready])
    }

    fn deploy_status(&self) -> Result<Vec<GuestStatus>> {
        Ok(vec![GuestStatus::Ready])
    }

    async fn validate_create_data(
        &self,
        _credential: &Credential,
        input: ServerCreateInput,
    ) -> Result<ServerCreateInput> {
        if input.billing_cycle.is_some() {
            return Err(Error::ValidationFailed(
                "prepaid billing is not supported on azure".into(),
            ));
        }
        validate_managed_disks(self, input)
    }

    fn validate_resize_disk(&self, guest: &Guest, disk: &Disk, new_size_mb: u64) -> Result<()> {
        ensure_status(&[GuestStatus::Ready], guest, "resize_disk")?;
        if new_size_mb <= disk.size_mb {
            return Err(Error::ValidationFailed(format!(
                "new size {}MB must exceed the current {}MB",
                new_size_mb, disk.size_mb
            )));
        }
        Ok(())
    }

    async fn request_guest_create_all_disks(
        &self,
        guest: &Guest,
        disks: &[Disk],
        task: &TaskHandle,
    ) -> Result<()> {
        self.backend.create_all_disks(guest, disks, task).await
    }

    async fn request_create_disk(&self, disk: &Disk, task: &TaskHandle) -> Result<()> {
        self.backend.create_disk(disk, task)
    }

    async fn request_deploy_guest_on_host(
        &self,
        guest: &Guest,
        disks: &[Disk],
        _host: Option<&Host>,
        task: &TaskHandle,
    ) -> Result<()> {
        self.backend.deploy(guest, disks, task)
    }

    async fn request_start_on_host(&self, guest: &Guest, task: &TaskHandle) -> Result<()> {
        self.backend.start(guest, task)
    }

    async fn request_sync_status(&self, guest: &Guest, task: &TaskHandle) -> Result<()> {
        self.backend.sync_status(guest, task)
    }

    async fn request_detach_disk(&self, guest: &Guest, disk: &Disk, task: &TaskHandle) -> Result<()> {
        self.backend.detach_disk(guest, disk, task)
    }

    async fn request_attach_disk(&self, guest: &Guest, disk: &Disk, task: &TaskHandle) -> Result<()> {
        self.backend.attach_disk(guest, disk, task)
    }

    async fn request_change_vm_config(
        &self,
        guest: &Guest,
        vcpu_count: u32,
        vmem_size_mb: u64,
        task: &TaskHandle,
    ) -> Result<()> {
        self.backend
            .change_config(guest, vcpu_count, vmem_size_mb, task)
    }

    async fn request_resize_disk(
        &self,
        _guest: &Guest,
        disk: &Disk,
        size_mb: u64,
        task: &TaskHandle,
    ) -> Result<()> {
        self.backend.resize_disk(disk, size_mb, task)
    }

    async fn request_undeploy_guest_on_host(&self, guest: &Guest, task: &TaskHandle) -> Result<()> {
        self.backend.undeploy(guest, task)
    }

    async fn request_delete_detached_disk(
        &self,
        disk: &Disk,
        _purge: bool,
        task: &TaskHandle,
    ) -> Result<()> {
        self.backend.delete_disk(disk, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::DiskConfig;
    use crate::drivers::cloud::SimulatedCloud;

    fn driver() -> AzureGuestDriver {
        AzureGuestDriver::new(SimulatedCloud::new(providers::AZURE), StageRetry::none())
    }

    #[test]
    fn test_running_guest_cannot_detach() {
        let allowed = driver().detach_disk_status().unwrap();
        assert!(!allowed.contains(&GuestStatus::Running));
        assert!(driver().rebuild_root_status().unwrap_err().is_not_implemented());
    }

    #[tokio::test]
    async fn test_create_validation() {
        let input = ServerCreateInput {
            name: "vm".into(),
            provider: providers::AZURE.into(),
            disks: vec![DiskConfig::new(20 * 1024)],
            ..Default::default()
        };
        let cred = Credential::new("default", "p1");
        assert!(driver().validate_create_data(&cred, input.clone()).await.is_err());

        let input = ServerCreateInput {
            disks: vec![DiskConfig::new(30 * 1024)],
            ..input
        };
        let validated = driver().validate_create_data(&cred, input).await.unwrap();
        assert_eq!(validated.disks[0].backend.as_deref(), Some(storage::STANDARD_LRS));
    }
}
