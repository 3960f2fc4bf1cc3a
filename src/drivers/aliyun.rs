//! Aliyun Guest Driver

use crate::domain::model::{Disk, DiskType, Guest, GuestStatus, Host};
use crate::domain::ports::{providers, storage, BillingCycle, Credential, ServerCreateInput};
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
    storage::CLOUD_EFFICIENCY,
    storage::CLOUD_SSD,
    storage::CLOUD_ESSD,
    storage::PUBLIC_CLOUD,
    storage::EPHEMERAL_SSD,
];

/// Backends whose disks can be resized in place
const RESIZABLE_STORAGE: &[&str] = &[
    storage::PUBLIC_CLOUD,
    storage::CLOUD_SSD,
    storage::CLOUD_EFFICIENCY,
];

const SYS_DISK_RANGE_GB: RangeInclusive<u64> = 20..=500;
const MAX_NETWORKS: usize = 2;
const BILLING_MONTHS: &[u32] = &[12, 24, 36, 48, 60];

pub struct AliyunGuestDriver {
    backend: ManagedBackend,
}

impl AliyunGuestDriver {
    pub fn new(cloud: CloudApiRef, retry: StageRetry) -> Self {
        Self {
            backend: ManagedBackend::new(cloud, retry),
        }
    }
}

pub fn register(builder: &mut DriverRegistryBuilder, cloud: CloudApiRef, retry: StageRetry) {
    builder.register_guest_driver(Arc::new(AliyunGuestDriver::new(cloud, retry)));
}

fn ready_or_running() -> Vec<GuestStatus> {
    vec![GuestStatus::Ready, GuestStatus::Running]
}

#[async_trait]
impl GuestDriver for AliyunGuestDriver {
    fn provider(&self) -> &'static str {
        providers::ALIYUN
    }

    fn default_sys_disk_backend(&self) -> &'static str {
        storage::CLOUD_EFFICIENCY
    }

    fn minimal_sys_disk_size_gb(&self) -> u64 {
        20
    }

    fn storage_types(&self) -> &'static [&'static str] {
        STORAGE_TYPES
    }

    fn disk_size_range_gb(&self, backend: &str) -> Option<RangeInclusive<u64>> {
        match backend {
            storage::CLOUD_EFFICIENCY | storage::CLOUD_SSD | storage::CLOUD_ESSD => {
                Some(20..=32768)
            }
            storage::PUBLIC_CLOUD => Some(5..=2000),
            storage::EPHEMERAL_SSD => Some(5..=800),
            _ => None,
        }
    }

    fn is_supported_billing_cycle(&self, cycle: &BillingCycle) -> bool {
        let weeks = cycle.weeks();
        if (1..=4).contains(&weeks) {
            return true;
        }
        let months = cycle.months();
        (1..=10).contains(&months) || BILLING_MONTHS.contains(&months)
    }

    fn linux_default_account(&self, image_type: &str, os_type: &str) -> String {
        if image_type == "system" && os_type == "Windows" {
            "Administrator".to_string()
        } else {
            "root".to_string()
        }
    }

    fn detach_disk_status(&self) -> Result<Vec<GuestStatus>> {
        Ok(ready_or_running())
    }

    fn attach_disk_status(&self) -> Result<Vec<GuestStatus>> {
        Ok(ready_or_running())
    }

    fn rebuild_root_status(&self) -> Result<Vec<GuestStatus>> {
        Ok(ready_or_running())
    }

    fn change_config_status(&self) -> Result<Vec<GuestStatus>> {
        Ok(ready_or_running())
    }

    fn deploy_status(&self) -> Result<Vec<GuestStatus>> {
        Ok(ready_or_running())
    }

    async fn validate_create_data(
        &self,
        _credential: &Credential,
        input: ServerCreateInput,
    ) -> Result<ServerCreateInput> {
        if input.networks.len() > MAX_NETWORKS {
            return Err(Error::ValidationFailed(format!(
                "cannot attach more than {} networks",
                MAX_NETWORKS
            )));
        }
        if let Some(sys) = input.disks.first() {
            let size_gb = sys.size_mb / 1024;
            if sys.size_mb < SYS_DISK_RANGE_GB.start() * 1024
                || sys.size_mb > SYS_DISK_RANGE_GB.end() * 1024
            {
                return Err(Error::ValidationFailed(format!(
                    "the system disk size must be in the range of {}GB ~ {}GB, got {}GB",
                    SYS_DISK_RANGE_GB.start(),
                    SYS_DISK_RANGE_GB.end(),
                    size_gb
                )));
            }
        }
        validate_managed_disks(self, input)
    }

    fn validate_resize_disk(&self, guest: &Guest, disk: &Disk, new_size_mb: u64) -> Result<()> {
        ensure_status(&ready_or_running(), guest, "resize_disk")?;
        if disk.disk_type == DiskType::Sys {
            return Err(Error::ValidationFailed("cannot resize the system disk".into()));
        }
        if !RESIZABLE_STORAGE.contains(&disk.backend.as_str()) {
            return Err(Error::ValidationFailed(format!(
                "cannot resize {} disk",
                disk.backend
            )));
        }
        if new_size_mb <= disk.size_mb {
            return Err(Error::ValidationFailed(format!(
                "new size {}MB must exceed the current {}MB",
                new_size_mb, disk.size_mb
            )));
        }
        if let Some(range) = self.disk_size_range_gb(&disk.backend) {
            if new_size_mb > range.end() * 1024 {
                return Err(Error::ValidationFailed(format!(
                    "the {} disk size cannot exceed {}GB",
                    disk.backend,
                    range.end()
                )));
            }
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

    async fn request_rebuild_root_disk(
        &self,
        guest: &Guest,
        image_id: Option<&str>,
        task: &TaskHandle,
    ) -> Result<()> {
        self.backend.rebuild_root(guest, image_id, task)
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
    use crate::domain::ports::{DiskConfig, NetworkConfig};
    use crate::drivers::cloud::SimulatedCloud;
    use assert_matches::assert_matches;

    fn driver() -> AliyunGuestDriver {
        AliyunGuestDriver::new(SimulatedCloud::new(providers::ALIYUN), StageRetry::none())
    }

    fn input(disks: Vec<DiskConfig>) -> ServerCreateInput {
        ServerCreateInput {
            name: "web".into(),
            provider: providers::ALIYUN.into(),
            vcpu_count: 2,
            vmem_size_mb: 4096,
            disks,
            ..Default::default()
        }
    }

    async fn validate(input: ServerCreateInput) -> Result<ServerCreateInput> {
        driver()
            .validate_create_data(&Credential::new("default", "p1"), input)
            .await
    }

    #[tokio::test]
    async fn test_system_disk_below_minimum_rejected() {
        let err = validate(input(vec![DiskConfig::new(10 * 1024)]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ValidationFailed(_));
    }

    #[tokio::test]
    async fn test_default_backend_filled_in() {
        let validated = validate(input(vec![
            DiskConfig::new(40 * 1024),
            DiskConfig::new(100 * 1024).with_backend(storage::CLOUD_SSD),
        ]))
        .await
        .unwrap();

        assert_eq!(
            validated.disks[0].backend.as_deref(),
            Some(storage::CLOUD_EFFICIENCY)
        );
        assert_eq!(validated.disks[1].backend.as_deref(), Some(storage::CLOUD_SSD));
    }

    #[tokio::test]
    async fn test_backend_ranges_enforced() {
        // 4GB public cloud data disk is below its 5GB floor
        let err = validate(input(vec![
            DiskConfig::new(40 * 1024),
            DiskConfig::new(4 * 1024).with_backend(storage::PUBLIC_CLOUD),
        ]))
        .await
        .unwrap_err();
        assert_matches!(err, Error::ValidationFailed(_));

        let err = validate(input(vec![
            DiskConfig::new(40 * 1024),
            DiskConfig::new(900 * 1024).with_backend(storage::EPHEMERAL_SSD),
        ]))
        .await
        .unwrap_err();
        assert_matches!(err, Error::ValidationFailed(_));

        let err = validate(input(vec![DiskConfig::new(40 * 1024).with_backend("nfs")]))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ValidationFailed(_));
    }

    #[tokio::test]
    async fn test_too_many_networks_rejected() {
        let mut request = input(vec![DiskConfig::new(40 * 1024)]);
        request.networks = vec![NetworkConfig::default(); 3];
        assert_matches!(validate(request).await, Err(Error::ValidationFailed(_)));
    }

    #[test]
    fn test_billing_cycles() {
        let driver = driver();
        let supported = |s: &str| driver.is_supported_billing_cycle(&s.parse().unwrap());

        assert!(supported("1W"));
        assert!(supported("4W"));
        assert!(!supported("5W"));
        assert!(supported("10M"));
        assert!(!supported("11M"));
        assert!(supported("1Y"));
        assert!(supported("5Y"));
        assert!(!supported("6Y"));
        assert!(!supported("3H"));
    }

    #[test]
    fn test_resize_rules() {
        let driver = driver();
        let mut guest = Guest::new("web", providers::ALIYUN);
        guest.status = GuestStatus::Running;

        let mut data = Disk::new("data", 40 * 1024, storage::CLOUD_SSD);
        assert!(driver.validate_resize_disk(&guest, &data, 80 * 1024).is_ok());
        assert!(driver.validate_resize_disk(&guest, &data, 20 * 1024).is_err());

        data.backend = storage::CLOUD_ESSD.into();
        assert!(driver.validate_resize_disk(&guest, &data, 80 * 1024).is_err());

        let mut sys = Disk::new("sys", 40 * 1024, storage::CLOUD_SSD);
        sys.disk_type = DiskType::Sys;
        assert!(driver.validate_resize_disk(&guest, &sys, 80 * 1024).is_err());

        guest.status = GuestStatus::Deploying;
        let data = Disk::new("data", 40 * 1024, storage::CLOUD_SSD);
        assert_matches!(
            driver.validate_resize_disk(&guest, &data, 80 * 1024),
            Err(Error::InvalidState { .. })
        );
    }

    #[test]
    fn test_default_accounts() {
        let driver = driver();
        assert_eq!(driver.linux_default_account("system", "Windows"), "Administrator");
        assert_eq!(driver.linux_default_account("customized", "Windows"), "root");
        assert_eq!(driver.linux_default_account("system", "Linux"), "root");
    }
}
