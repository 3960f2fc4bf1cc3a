//! Domain Model - Guest, disk and host records
//!
//! Only the fields the workflows need are modelled here. The authoritative
//! records live with the persistence collaborator behind `GuestStore`;
//! `MemoryGuestStore` is the in-process implementation.

use crate::domain::ports::GuestStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

// =============================================================================
// Guest Status
// =============================================================================

/// Lifecycle status of a guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuestStatus {
    Init,
    Creating,
    Deploying,
    Ready,
    Running,
    Starting,
    ChangingConfig,
    Rebuilding,
    DetachingDisk,
    AttachingDisk,
    ResizingDisk,
    Deleting,
    Deleted,
    CreateFailed,
    DeleteFailed,
    Unknown,
}

impl GuestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestStatus::Init => "init",
            GuestStatus::Creating => "creating",
            GuestStatus::Deploying => "deploying",
            GuestStatus::Ready => "ready",
            GuestStatus::Running => "running",
            GuestStatus::Starting => "starting",
            GuestStatus::ChangingConfig => "changing_config",
            GuestStatus::Rebuilding => "rebuilding",
            GuestStatus::DetachingDisk => "detaching_disk",
            GuestStatus::AttachingDisk => "attaching_disk",
            GuestStatus::ResizingDisk => "resizing_disk",
            GuestStatus::Deleting => "deleting",
            GuestStatus::Deleted => "deleted",
            GuestStatus::CreateFailed => "create_failed",
            GuestStatus::DeleteFailed => "delete_failed",
            GuestStatus::Unknown => "unknown",
        }
    }

    /// Stable statuses a workflow may restore after a transient one
    pub fn is_settled(&self) -> bool {
        matches!(self, GuestStatus::Ready | GuestStatus::Running)
    }
}

impl std::fmt::Display for GuestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Records
// =============================================================================

/// A virtual guest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guest {
    pub id: String,
    pub name: String,
    /// Fixed at creation
    pub provider: String,
    pub status: GuestStatus,
    pub vcpu_count: u32,
    pub vmem_size_mb: u64,
    /// Attached disk ids, system disk first
    pub disks: Vec<String>,
    pub host_id: Option<String>,
    /// Id of the instance at the provider once deployed
    pub external_id: Option<String>,
    pub image_id: Option<String>,
    pub domain_id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Guest {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id("guest"),
            name: name.into(),
            provider: provider.into(),
            status: GuestStatus::Init,
            vcpu_count: 1,
            vmem_size_mb: 1024,
            disks: Vec::new(),
            host_id: None,
            external_id: None,
            image_id: None,
            domain_id: String::new(),
            project_id: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Role of a disk within its guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    Sys,
    Data,
}

/// Disk status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskStatus {
    Init,
    Creating,
    Ready,
    Resizing,
    Detaching,
    Deleted,
    Failed,
}

impl std::fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskStatus::Init => write!(f, "init"),
            DiskStatus::Creating => write!(f, "creating"),
            DiskStatus::Ready => write!(f, "ready"),
            DiskStatus::Resizing => write!(f, "resizing"),
            DiskStatus::Detaching => write!(f, "detaching"),
            DiskStatus::Deleted => write!(f, "deleted"),
            DiskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A block device, attached to at most one guest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub id: String,
    pub name: String,
    pub guest_id: Option<String>,
    pub size_mb: u64,
    /// Storage backend (e.g. `cloud_ssd`)
    pub backend: String,
    pub disk_type: DiskType,
    pub status: DiskStatus,
    pub external_id: Option<String>,
    pub image_id: Option<String>,
}

impl Disk {
    pub fn new(name: impl Into<String>, size_mb: u64, backend: impl Into<String>) -> Self {
        Self {
            id: generate_id("disk"),
            name: name.into(),
            guest_id: None,
            size_mb,
            backend: backend.into(),
            disk_type: DiskType::Data,
            status: DiskStatus::Init,
            external_id: None,
            image_id: None,
        }
    }
}

/// Host type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostType {
    Baremetal,
    Hypervisor,
}

/// A physical or virtual host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub host_type: HostType,
    pub enabled: bool,
}

impl Host {
    pub fn baremetal(name: impl Into<String>) -> Self {
        Self {
            id: generate_id("host"),
            name: name.into(),
            host_type: HostType::Baremetal,
            enabled: true,
        }
    }

    pub fn is_baremetal(&self) -> bool {
        self.host_type == HostType::Baremetal
    }
}

// =============================================================================
// Memory Guest Store
// =============================================================================

/// In-memory `GuestStore`
#[derive(Default)]
pub struct MemoryGuestStore {
    guests: RwLock<BTreeMap<String, Guest>>,
    disks: RwLock<BTreeMap<String, Disk>>,
    hosts: RwLock<BTreeMap<String, Host>>,
}

impl MemoryGuestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: &str, id: &str) -> Error {
    Error::ResourceNotFound {
        kind: kind.into(),
        name: id.into(),
    }
}

fn exists(kind: &str, id: &str) -> Error {
    Error::ResourceExists {
        kind: kind.into(),
        name: id.into(),
    }
}

#[async_trait]
impl GuestStore for MemoryGuestStore {
    async fn get_guest(&self, id: &str) -> Result<Option<Guest>> {
        Ok(self.guests.read().await.get(id).cloned())
    }

    async fn insert_guest(&self, guest: Guest) -> Result<()> {
        let mut guests = self.guests.write().await;
        if guests.contains_key(&guest.id) {
            return Err(exists("guest", &guest.id));
        }
        guests.insert(guest.id.clone(), guest);
        Ok(())
    }

    async fn update_guest(&self, guest: Guest) -> Result<()> {
        let mut guests = self.guests.write().await;
        match guests.get_mut(&guest.id) {
            Some(slot) => {
                *slot = guest;
                Ok(())
            }
            None => Err(not_found("guest", &guest.id)),
        }
    }

    async fn list_guests(&self) -> Result<Vec<Guest>> {
        Ok(self.guests.read().await.values().cloned().collect())
    }

    async fn get_disk(&self, id: &str) -> Result<Option<Disk>> {
        Ok(self.disks.read().await.get(id).cloned())
    }

    async fn insert_disk(&self, disk: Disk) -> Result<()> {
        let mut disks = self.disks.write().await;
        if disks.contains_key(&disk.id) {
            return Err(exists("disk", &disk.id));
        }
        disks.insert(disk.id.clone(), disk);
        Ok(())
    }

    async fn update_disk(&self, disk: Disk) -> Result<()> {
        let mut disks = self.disks.write().await;
        match disks.get_mut(&disk.id) {
            Some(slot) => {
                *slot = disk;
                Ok(())
            }
            None => Err(not_found("disk", &disk.id)),
        }
    }

    async fn get_host(&self, id: &str) -> Result<Option<Host>> {
        Ok(self.hosts.read().await.get(id).cloned())
    }

    async fn insert_host(&self, host: Host) -> Result<()> {
        let mut hosts = self.hosts.write().await;
        if hosts.contains_key(&host.id) {
            return Err(exists("host", &host.id));
        }
        hosts.insert(host.id.clone(), host);
        Ok(())
    }

    async fn update_host(&self, host: Host) -> Result<()> {
        let mut hosts = self.hosts.write().await;
        match hosts.get_mut(&host.id) {
            Some(slot) => {
                *slot = host;
                Ok(())
            }
            None => Err(not_found("host", &host.id)),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique id such as `guest-0000018f3a2b4c5d-0001`
pub fn generate_id(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default();
    let seq = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xffff;
    format!("{}-{:016x}-{:04x}", prefix, now, seq)
}
