//! Domain Ports - Shared vocabulary and collaborator boundaries
//!
//! Value types that flow between the orchestrator, the task engine and the
//! capability drivers, plus the `GuestStore` port through which workflows
//! read and update the guest/disk/host records they act on.

use crate::domain::model::{Disk, Guest, GuestStatus, Host};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

// =============================================================================
// Provider and Storage Identifiers
// =============================================================================

/// Provider discriminators used as driver registry keys
pub mod providers {
    pub const ALIYUN: &str = "aliyun";
    pub const AZURE: &str = "azure";
    pub const QCLOUD: &str = "qcloud";
}

/// Storage backend names understood by the built-in drivers
pub mod storage {
    pub const CLOUD_EFFICIENCY: &str = "cloud_efficiency";
    pub const CLOUD_SSD: &str = "cloud_ssd";
    pub const CLOUD_ESSD: &str = "cloud_essd";
    pub const PUBLIC_CLOUD: &str = "cloud";
    pub const EPHEMERAL_SSD: &str = "ephemeral_ssd";

    pub const STANDARD_LRS: &str = "standard_lrs";
    pub const PREMIUM_LRS: &str = "premium_lrs";
    pub const STANDARDSSD_LRS: &str = "standardssd_lrs";
}

/// Registered workflow names
pub mod workflows {
    pub const GUEST_CREATE_TASK: &str = "GuestCreateTask";
    pub const DISK_CREATE_TASK: &str = "DiskCreateTask";
    pub const GUEST_START_TASK: &str = "GuestStartTask";
    pub const GUEST_SYNCSTATUS_TASK: &str = "GuestSyncstatusTask";
    pub const GUEST_DELETE_TASK: &str = "GuestDeleteTask";
    pub const GUEST_CHANGE_CONFIG_TASK: &str = "GuestChangeConfigTask";
    pub const DISK_RESIZE_TASK: &str = "DiskResizeTask";
    pub const GUEST_REBUILD_ROOT_TASK: &str = "GuestRebuildRootTask";
    pub const GUEST_DETACH_DISK_TASK: &str = "GuestDetachDiskTask";
    pub const GUEST_ATTACH_DISK_TASK: &str = "GuestAttachDiskTask";
    pub const BAREMETAL_CONVERT_HYPERVISOR_TASK: &str = "BaremetalConvertHypervisorTask";

    /// Alias accepted in a create request's `__task__` field
    pub const CONVERT_TASK_ALIAS: &str = "convert_task";
}

// =============================================================================
// Resource References
// =============================================================================

/// Kind of resource a task or driver acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Guest,
    Disk,
    Host,
    CloudAccount,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Guest => write!(f, "guest"),
            ResourceKind::Disk => write!(f, "disk"),
            ResourceKind::Host => write!(f, "host"),
            ResourceKind::CloudAccount => write!(f, "cloud_account"),
        }
    }
}

/// Non-owning reference to a domain resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn guest(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Guest, id)
    }

    pub fn disk(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Disk, id)
    }

    pub fn host(id: impl Into<String>) -> Self {
        Self::new(ResourceKind::Host, id)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// =============================================================================
// Credential
// =============================================================================

/// Identity context a task's backend operations execute under
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: String,
    pub user: String,
    pub domain_id: String,
    pub project_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Credential {
    pub fn new(domain_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            domain_id: domain_id.into(),
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>, user: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.user = user.into();
        self
    }
}

// =============================================================================
// Billing Cycle
// =============================================================================

/// Unit of a prepaid billing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingUnit {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

/// Prepaid billing cycle such as `1H`, `2W`, `1M` or `3Y`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingCycle {
    pub count: u32,
    pub unit: BillingUnit,
}

impl BillingCycle {
    /// Whole weeks, or 0 if the cycle is not expressible in weeks
    pub fn weeks(&self) -> u32 {
        match self.unit {
            BillingUnit::Week => self.count,
            BillingUnit::Day if self.count % 7 == 0 => self.count / 7,
            _ => 0,
        }
    }

    /// Whole months, or 0 if the cycle is not expressible in months
    pub fn months(&self) -> u32 {
        match self.unit {
            BillingUnit::Month => self.count,
            BillingUnit::Year => self.count * 12,
            _ => 0,
        }
    }
}

impl FromStr for BillingCycle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::ValidationFailed(format!("invalid billing cycle: {}", s)))?;
        let (count, unit) = s.split_at(split);

        let count: u32 = count
            .parse()
            .map_err(|_| Error::ValidationFailed(format!("invalid billing cycle: {}", s)))?;
        if count == 0 {
            return Err(Error::ValidationFailed(format!(
                "billing cycle must be positive: {}",
                s
            )));
        }

        let unit = match unit.to_ascii_uppercase().as_str() {
            "H" => BillingUnit::Hour,
            "D" => BillingUnit::Day,
            "W" => BillingUnit::Week,
            "M" => BillingUnit::Month,
            "Y" => BillingUnit::Year,
            other => {
                return Err(Error::ValidationFailed(format!(
                    "unknown billing unit: {}",
                    other
                )))
            }
        };

        Ok(Self { count, unit })
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unit = match self.unit {
            BillingUnit::Hour => "H",
            BillingUnit::Day => "D",
            BillingUnit::Week => "W",
            BillingUnit::Month => "M",
            BillingUnit::Year => "Y",
        };
        write!(f, "{}{}", self.count, unit)
    }
}

// =============================================================================
// Server Create Input
// =============================================================================

/// Requested disk of a new guest; the first entry is the system disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskConfig {
    pub size_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

impl DiskConfig {
    pub fn new(size_mb: u64) -> Self {
        Self {
            size_mb,
            ..Default::default()
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }
}

/// Requested network attachment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Guest create request after placement has been decided
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCreateInput {
    pub name: String,
    pub provider: String,
    pub vcpu_count: u32,
    pub vmem_size_mb: u64,
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_cycle: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_baremetal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Alternate workflow requested by the caller
    #[serde(rename = "__task__", default, skip_serializing_if = "Option::is_none")]
    pub embedded_task: Option<String>,
}

impl ServerCreateInput {
    /// Total requested storage across all disks
    pub fn storage_mb(&self) -> u64 {
        self.disks.iter().map(|d| d.size_mb).sum()
    }

    /// Host named by the placement hints, if any
    pub fn preferred_host(&self) -> Option<&str> {
        self.prefer_host_id
            .as_deref()
            .or(self.prefer_baremetal_id.as_deref())
    }
}

// =============================================================================
// Guest Store Port
// =============================================================================

/// Port for the guest/disk/host records the workflows act on
#[async_trait]
pub trait GuestStore: Send + Sync {
    async fn get_guest(&self, id: &str) -> Result<Option<Guest>>;

    /// Insert a new guest; fails if the id is taken
    async fn insert_guest(&self, guest: Guest) -> Result<()>;

    async fn update_guest(&self, guest: Guest) -> Result<()>;

    async fn list_guests(&self) -> Result<Vec<Guest>>;

    async fn get_disk(&self, id: &str) -> Result<Option<Disk>>;

    async fn insert_disk(&self, disk: Disk) -> Result<()>;

    async fn update_disk(&self, disk: Disk) -> Result<()>;

    async fn get_host(&self, id: &str) -> Result<Option<Host>>;

    async fn insert_host(&self, host: Host) -> Result<()>;

    async fn update_host(&self, host: Host) -> Result<()>;

    /// Fetch a guest that must exist
    async fn require_guest(&self, id: &str) -> Result<Guest> {
        self.get_guest(id).await?.ok_or_else(|| Error::ResourceNotFound {
            kind: "guest".into(),
            name: id.into(),
        })
    }

    /// Fetch a disk that must exist
    async fn require_disk(&self, id: &str) -> Result<Disk> {
        self.get_disk(id).await?.ok_or_else(|| Error::ResourceNotFound {
            kind: "disk".into(),
            name: id.into(),
        })
    }

    /// Fetch a host that must exist
    async fn require_host(&self, id: &str) -> Result<Host> {
        self.get_host(id).await?.ok_or_else(|| Error::ResourceNotFound {
            kind: "host".into(),
            name: id.into(),
        })
    }

    /// Set a guest's status and return the updated record
    async fn set_guest_status(&self, id: &str, status: GuestStatus) -> Result<Guest> {
        let mut guest = self.require_guest(id).await?;
        guest.status = status;
        guest.updated_at = chrono::Utc::now();
        self.update_guest(guest.clone()).await?;
        Ok(guest)
    }
}

pub type GuestStoreRef = Arc<dyn GuestStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_cycle_parse() {
        let bc: BillingCycle = "2W".parse().unwrap();
        assert_eq!(bc.unit, BillingUnit::Week);
        assert_eq!(bc.weeks(), 2);
        assert_eq!(bc.months(), 0);

        let bc: BillingCycle = "1y".parse().unwrap();
        assert_eq!(bc.months(), 12);
        assert_eq!(bc.to_string(), "1Y");

        let bc: BillingCycle = "14D".parse().unwrap();
        assert_eq!(bc.weeks(), 2);

        assert!("".parse::<BillingCycle>().is_err());
        assert!("M".parse::<BillingCycle>().is_err());
        assert!("0M".parse::<BillingCycle>().is_err());
        assert!("3X".parse::<BillingCycle>().is_err());
    }

    #[test]
    fn test_resource_ref_display() {
        assert_eq!(ResourceRef::guest("g-1").to_string(), "guest/g-1");
        assert_eq!(ResourceRef::host("h-1").to_string(), "host/h-1");
    }

    #[test]
    fn test_embedded_task_field() {
        let input: ServerCreateInput = serde_json::from_value(serde_json::json!({
            "name": "vm",
            "provider": "aliyun",
            "vcpu_count": 2,
            "vmem_size_mb": 2048,
            "__task__": "convert_task",
            "prefer_baremetal_id": "bm-1",
        }))
        .unwrap();

        assert_eq!(input.embedded_task.as_deref(), Some("convert_task"));
        assert_eq!(input.preferred_host(), Some("bm-1"));
        assert!(input.disks.is_empty());
    }
}
