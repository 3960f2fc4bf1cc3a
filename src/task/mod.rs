//! Task Runner
//!
//! Persistent staged tasks, their workflows, and the engine that drives them.

pub mod engine;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod store;
pub mod workflow;

pub use engine::{
    EngineConfig, ResumeReport, StageContext, TaskEngine, TaskEngineBuilder, TaskEvent, TaskHandle,
};
pub use metrics::EngineMetrics;
pub use record::{
    params, NewTask, ParamsExt, StageTransition, TaskError, TaskId, TaskParams, TaskRecord,
    TaskStatus,
};
pub use retry::StageRetry;
pub use store::{FileTaskStore, MemoryTaskStore, TaskStore, TaskStoreRef};
pub use workflow::{StageInput, WorkflowHandler, WorkflowStage};
