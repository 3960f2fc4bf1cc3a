//! Cloud Backend Port
//!
//! `CloudApi` is the boundary between the drivers and a provider's compute
//! API. Wire protocols are not implemented here; `SimulatedCloud` keeps VMs
//! and disks in memory with configurable latency and injected failures.

use crate::domain::model::{generate_id, GuestStatus};
use crate::error::{Error, Result};
use crate::task::record::TaskParams;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

// =============================================================================
// Backend Types
// =============================================================================

/// VM to create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub vcpu_count: u32,
    pub vmem_size_mb: u64,
    pub image_id: Option<String>,
    /// External ids of already created disks, system disk first
    pub disk_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPowerState {
    Running,
    Stopped,
}

/// VM as reported by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub external_id: String,
    pub name: String,
    pub status: VmPowerState,
    pub vcpu_count: u32,
    pub vmem_size_mb: u64,
    pub image_id: Option<String>,
    pub disks: Vec<String>,
}

/// Disk to create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
    pub name: String,
    pub size_mb: u64,
    pub backend: String,
}

/// Disk as reported by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub external_id: String,
    pub size_mb: u64,
    pub backend: String,
    pub attached_to: Option<String>,
}

/// Guest-facing summary of a VM, delivered to the task as callback data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmReport {
    pub external_id: String,
    pub status: GuestStatus,
    pub vcpu_count: u32,
    pub vmem_size_mb: u64,
    #[serde(default)]
    pub image_id: Option<String>,
}

impl From<VmInfo> for VmReport {
    fn from(info: VmInfo) -> Self {
        Self {
            external_id: info.external_id,
            status: match info.status {
                VmPowerState::Running => GuestStatus::Running,
                VmPowerState::Stopped => GuestStatus::Ready,
            },
            vcpu_count: info.vcpu_count,
            vmem_size_mb: info.vmem_size_mb,
            image_id: info.image_id,
        }
    }
}

impl VmReport {
    /// Read a report back out of a stage's merged data
    pub fn from_data(data: &TaskParams) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(data.clone()))?)
    }
}

impl DiskInfo {
    pub fn from_data(data: &TaskParams) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(data.clone()))?)
    }
}

// =============================================================================
// Port
// =============================================================================

/// Compute API of one provider
#[async_trait]
pub trait CloudApi: Send + Sync {
    fn provider(&self) -> &str;

    async fn create_vm(&self, spec: &VmSpec) -> Result<VmInfo>;

    /// Deleting an unknown VM succeeds
    async fn delete_vm(&self, external_id: &str) -> Result<()>;

    async fn start_vm(&self, external_id: &str) -> Result<VmInfo>;

    async fn vm_status(&self, external_id: &str) -> Result<VmInfo>;

    async fn change_vm_config(
        &self,
        external_id: &str,
        vcpu_count: u32,
        vmem_size_mb: u64,
    ) -> Result<VmInfo>;

    async fn rebuild_root(&self, external_id: &str, image_id: Option<&str>) -> Result<VmInfo>;

    async fn create_disk(&self, spec: &DiskSpec) -> Result<DiskInfo>;

    /// Deleting an unknown disk succeeds
    async fn delete_disk(&self, external_id: &str) -> Result<()>;

    async fn resize_disk(&self, external_id: &str, size_mb: u64) -> Result<DiskInfo>;

    async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> Result<DiskInfo>;

    /// Detaching a disk that is not attached succeeds
    async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> Result<DiskInfo>;
}

pub type CloudApiRef = Arc<dyn CloudApi>;

// =============================================================================
// Simulated Backend
// =============================================================================

/// In-memory provider backend
pub struct SimulatedCloud {
    provider: String,
    latency: Duration,
    vms: RwLock<BTreeMap<String, VmInfo>>,
    disks: RwLock<BTreeMap<String, DiskInfo>>,
    /// Remaining injected failures per operation
    faults: Mutex<HashMap<String, u32>>,
}

impl SimulatedCloud {
    pub fn new(provider: impl Into<String>) -> Arc<Self> {
        Self::with_latency(provider, Duration::ZERO)
    }

    pub fn with_latency(provider: impl Into<String>, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            provider: provider.into(),
            latency,
            vms: RwLock::new(BTreeMap::new()),
            disks: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(HashMap::new()),
        })
    }

    /// Make the next `times` calls of `operation` fail with a backend error
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.faults.lock().insert(operation.to_string(), times);
    }

    pub async fn vm(&self, external_id: &str) -> Option<VmInfo> {
        self.vms.read().await.get(external_id).cloned()
    }

    pub async fn disk(&self, external_id: &str) -> Option<DiskInfo> {
        self.disks.read().await.get(external_id).cloned()
    }

    pub async fn vm_count(&self) -> usize {
        self.vms.read().await.len()
    }

    async fn enter(&self, operation: &str) -> Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let injected = {
            let mut faults = self.faults.lock();
            match faults.get_mut(operation) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if injected {
            return Err(Error::backend(&self.provider, operation, "injected failure"));
        }

        debug!(provider = %self.provider, operation, "Simulated backend call");
        Ok(())
    }

    fn missing(&self, operation: &str, what: &str, id: &str) -> Error {
        Error::BackendFailure {
            provider: self.provider.clone(),
            operation: operation.to_string(),
            reason: format!("{} {} not found", what, id),
        }
    }

    async fn update_vm<F>(&self, operation: &str, external_id: &str, apply: F) -> Result<VmInfo>
    where
        F: FnOnce(&mut VmInfo) + Send,
    {
        self.enter(operation).await?;
        let mut vms = self.vms.write().await;
        let vm = vms
            .get_mut(external_id)
            .ok_or_else(|| self.missing(operation, "vm", external_id))?;
        apply(vm);
        Ok(vm.clone())
    }
}

#[async_trait]
impl CloudApi for SimulatedCloud {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn create_vm(&self, spec: &VmSpec) -> Result<VmInfo> {
        self.enter("create_vm").await?;

        let external_id = generate_id("i");
        {
            let mut disks = self.disks.write().await;
            for disk_id in &spec.disk_ids {
                let disk = disks
                    .get_mut(disk_id)
                    .ok_or_else(|| self.missing("create_vm", "disk", disk_id))?;
                disk.attached_to = Some(external_id.clone());
            }
        }

        let vm = VmInfo {
            external_id: external_id.clone(),
            name: spec.name.clone(),
            status: VmPowerState::Stopped,
            vcpu_count: spec.vcpu_count,
            vmem_size_mb: spec.vmem_size_mb,
            image_id: spec.image_id.clone(),
            disks: spec.disk_ids.clone(),
        };
        self.vms.write().await.insert(external_id, vm.clone());
        Ok(vm)
    }

    async fn delete_vm(&self, external_id: &str) -> Result<()> {
        self.enter("delete_vm").await?;
        let removed = self.vms.write().await.remove(external_id);
        if let Some(vm) = removed {
            let mut disks = self.disks.write().await;
            for disk_id in vm.disks {
                disks.remove(&disk_id);
            }
        }
        Ok(())
    }

    async fn start_vm(&self, external_id: &str) -> Result<VmInfo> {
        self.update_vm("start_vm", external_id, |vm| vm.status = VmPowerState::Running)
            .await
    }

    async fn vm_status(&self, external_id: &str) -> Result<VmInfo> {
        self.update_vm("vm_status", external_id, |_| {}).await
    }

    async fn change_vm_config(
        &self,
        external_id: &str,
        vcpu_count: u32,
        vmem_size_mb: u64,
    ) -> Result<VmInfo> {
        self.update_vm("change_vm_config", external_id, |vm| {
            vm.vcpu_count = vcpu_count;
            vm.vmem_size_mb = vmem_size_mb;
        })
        .await
    }

    async fn rebuild_root(&self, external_id: &str, image_id: Option<&str>) -> Result<VmInfo> {
        let image_id = image_id.map(str::to_string);
        self.update_vm("rebuild_root", external_id, |vm| {
            if image_id.is_some() {
                vm.image_id = image_id;
            }
            vm.status = VmPowerState::Stopped;
        })
        .await
    }

    async fn create_disk(&self, spec: &DiskSpec) -> Result<DiskInfo> {
        self.enter("create_disk").await?;
        let disk = DiskInfo {
            external_id: generate_id("d"),
            size_mb: spec.size_mb,
            backend: spec.backend.clone(),
            attached_to: None,
        };
        self.disks
            .write()
            .await
            .insert(disk.external_id.clone(), disk.clone());
        Ok(disk)
    }

    async fn delete_disk(&self, external_id: &str) -> Result<()> {
        self.enter("delete_disk").await?;
        self.disks.write().await.remove(external_id);
        Ok(())
    }

    async fn resize_disk(&self, external_id: &str, size_mb: u64) -> Result<DiskInfo> {
        self.enter("resize_disk").await?;
        let mut disks = self.disks.write().await;
        let disk = disks
            .get_mut(external_id)
            .ok_or_else(|| self.missing("resize_disk", "disk", external_id))?;
        if size_mb < disk.size_mb {
            return Err(Error::backend(
                &self.provider,
                "resize_disk",
                format!("cannot shrink disk from {} MB to {} MB", disk.size_mb, size_mb),
            ));
        }
        disk.size_mb = size_mb;
        Ok(disk.clone())
    }

    async fn attach_disk(&self, vm_id: &str, disk_id: &str) -> Result<DiskInfo> {
        self.enter("attach_disk").await?;
        let mut vms = self.vms.write().await;
        let vm = vms
            .get_mut(vm_id)
            .ok_or_else(|| self.missing("attach_disk", "vm", vm_id))?;
        let mut disks = self.disks.write().await;
        let disk = disks
            .get_mut(disk_id)
            .ok_or_else(|| self.missing("attach_disk", "disk", disk_id))?;

        if let Some(other) = disk.attached_to.as_ref().filter(|o| o.as_str() != vm_id) {
            return Err(Error::backend(
                &self.provider,
                "attach_disk",
                format!("disk {} is attached to {}", disk_id, other),
            ));
        }
        disk.attached_to = Some(vm_id.to_string());
        if !vm.disks.iter().any(|d| d == disk_id) {
            vm.disks.push(disk_id.to_string());
        }
        Ok(disk.clone())
    }

    async fn detach_disk(&self, vm_id: &str, disk_id: &str) -> Result<DiskInfo> {
        self.enter("detach_disk").await?;
        if let Some(vm) = self.vms.write().await.get_mut(vm_id) {
            vm.disks.retain(|d| d != disk_id);
        }
        let mut disks = self.disks.write().await;
        let disk = disks
            .get_mut(disk_id)
            .ok_or_else(|| self.missing("detach_disk", "disk", disk_id))?;
        disk.attached_to = None;
        Ok(disk.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_spec(size_mb: u64) -> DiskSpec {
        DiskSpec {
            name: "sys".into(),
            size_mb,
            backend: "cloud_ssd".into(),
        }
    }

    #[tokio::test]
    async fn test_vm_lifecycle() {
        let cloud = SimulatedCloud::new("aliyun");
        let sys = cloud.create_disk(&disk_spec(40960)).await.unwrap();
        let vm = cloud
            .create_vm(&VmSpec {
                name: "web".into(),
                vcpu_count: 2,
                vmem_size_mb: 4096,
                image_id: Some("img-1".into()),
                disk_ids: vec![sys.external_id.clone()],
            })
            .await
            .unwrap();

        assert_eq!(vm.status, VmPowerState::Stopped);
        assert_eq!(
            cloud.disk(&sys.external_id).await.unwrap().attached_to,
            Some(vm.external_id.clone())
        );

        let started = cloud.start_vm(&vm.external_id).await.unwrap();
        assert_eq!(VmReport::from(started).status, GuestStatus::Running);

        cloud.delete_vm(&vm.external_id).await.unwrap();
        assert!(cloud.disk(&sys.external_id).await.is_none());
        // A second delete is a no-op
        cloud.delete_vm(&vm.external_id).await.unwrap();
        assert_eq!(cloud.vm_count().await, 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_retryable() {
        let cloud = SimulatedCloud::new("aliyun");
        cloud.fail_next("create_disk", 1);

        let err = cloud.create_disk(&disk_spec(1024)).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(cloud.create_disk(&disk_spec(1024)).await.is_ok());
    }

    #[tokio::test]
    async fn test_resize_refuses_to_shrink() {
        let cloud = SimulatedCloud::new("aliyun");
        let disk = cloud.create_disk(&disk_spec(40960)).await.unwrap();

        assert!(cloud.resize_disk(&disk.external_id, 20480).await.is_err());
        let grown = cloud.resize_disk(&disk.external_id, 81920).await.unwrap();
        assert_eq!(grown.size_mb, 81920);
    }

    #[test]
    fn test_vm_report_from_data() {
        let data = crate::task::record::params(serde_json::json!({
            "guest_id": "g-1",
            "external_id": "i-1",
            "status": "running",
            "vcpu_count": 2,
            "vmem_size_mb": 2048,
        }));
        let report = VmReport::from_data(&data).unwrap();
        assert_eq!(report.external_id, "i-1");
        assert_eq!(report.status, GuestStatus::Running);
        assert!(report.image_id.is_none());
    }
}
