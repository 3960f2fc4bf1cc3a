//! Cloud Control Plane
//!
//! Creates, reconfigures and tears down virtual guests across heterogeneous
//! cloud and hypervisor backends through one guest lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 REST API  /v1/guests  /v1/tasks                       │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                  Guest Lifecycle Orchestrator                         │
//! │        status predicates · validation · quota reservation             │
//! ├────────────────────────────────┬─────────────────────────────────────┤
//! │        Task Engine              │         Quota Ledger                │
//! │  typed stages · child tasks     │  reserve · commit · cancel          │
//! │  single dispatch · resume       │  per-scope serialization            │
//! ├────────────────────────────────┴─────────────────────────────────────┤
//! │                        Driver Registry                                │
//! │   (guest, aliyun)   (guest, azure)   (cloud-account, qcloud)          │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                   Cloud backend port (CloudApi)                       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`task`]: task records, typed workflows and the engine that drives them
//! - [`drivers`]: capability drivers, the registry and the cloud backend port
//! - [`quota`]: pending-usage reservations
//! - [`controlplane`]: guest workflows, the orchestrator and the REST API
//! - [`domain`]: guest/disk/host records and shared ports
//! - [`config`]: configuration file
//! - [`error`]: error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod drivers;
pub mod error;
pub mod quota;
pub mod task;

// Re-export commonly used types
pub use config::ControlPlaneConfig;

pub use controlplane::{
    Accepted, ApiServer, ApiServerConfig, ControlPlane, GuestOrchestrator, OrchestratorConfig,
    RestRouter,
};

pub use domain::model::{Disk, Guest, GuestStatus, Host, MemoryGuestStore};
pub use domain::ports::{Credential, GuestStore, GuestStoreRef, ResourceKind, ResourceRef, ServerCreateInput};

pub use drivers::{
    DriverEnvironment, DriverRegistry, GuestDriver, ProviderDriver, SimulatedCloud,
};

pub use error::{Error, ErrorAction, Result};

pub use quota::{QuotaDeltas, QuotaLedger, QuotaResource, QuotaScope, Reservation};

pub use task::{
    EngineConfig, FileTaskStore, MemoryTaskStore, NewTask, StageRetry, TaskEngine, TaskHandle,
    TaskRecord, TaskStatus, TaskStoreRef, WorkflowHandler, WorkflowStage,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
