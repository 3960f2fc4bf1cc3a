//! Task Records
//!
//! The persisted form of one workflow instance: identity, target, current
//! stage, the workflow's parameter bag, parent linkage and status.

use crate::domain::model::generate_id;
use crate::domain::ports::{Credential, ResourceRef};
use crate::error::{Error, Result};
use crate::quota::Reservation;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Identity and Status
// =============================================================================

/// Unique task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(generate_id("task"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task status; `Complete` and `Failed` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Init,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Init => write!(f, "init"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Terminal error retained on a failed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&Error> for TaskError {
    fn from(err: &Error) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// =============================================================================
// Parameter Bag
// =============================================================================

/// Workflow-local parameters; the schema belongs to each workflow
pub type TaskParams = serde_json::Map<String, Value>;

/// Lazy, per-key access to a parameter bag
pub trait ParamsExt {
    fn str_param(&self, key: &str) -> Option<&str>;
    fn u64_param(&self, key: &str) -> Option<u64>;
    fn bool_param(&self, key: &str, default: bool) -> bool;

    fn require_str(&self, key: &str) -> Result<&str> {
        self.str_param(key)
            .ok_or_else(|| Error::ValidationFailed(format!("missing task parameter: {}", key)))
    }

    fn require_u64(&self, key: &str) -> Result<u64> {
        self.u64_param(key)
            .ok_or_else(|| Error::ValidationFailed(format!("missing task parameter: {}", key)))
    }

    /// Deserialize a structured parameter
    fn typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>>;
}

impl ParamsExt for TaskParams {
    fn str_param(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn u64_param(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    fn bool_param(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    fn typed<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
        }
    }
}

/// Build a parameter bag from `json!({...})`; non-objects yield an empty bag
pub fn params(value: Value) -> TaskParams {
    match value {
        Value::Object(map) => map,
        _ => TaskParams::new(),
    }
}

// =============================================================================
// Task Record
// =============================================================================

/// One entry of a task's stage history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub stage: String,
    pub at: DateTime<Utc>,
}

/// Persisted workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Workflow name
    pub name: String,
    pub target: ResourceRef,
    pub params: TaskParams,
    pub parent_id: Option<TaskId>,
    pub stage: String,
    pub status: TaskStatus,
    pub credential: Credential,
    #[serde(default)]
    pub reservation: Option<Reservation>,
    #[serde(default)]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<StageTransition>,
}

impl TaskRecord {
    pub(crate) fn new(id: TaskId, request: NewTask, init_stage: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: request.workflow,
            target: request.target,
            params: request.params,
            parent_id: request.parent_id,
            stage: init_stage.to_string(),
            status: TaskStatus::Init,
            credential: request.credential,
            reservation: request.reservation,
            error: None,
            result: None,
            cancelled: false,
            created_at: now,
            updated_at: now,
            history: vec![StageTransition {
                stage: init_stage.to_string(),
                at: now,
            }],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stage names in the order they were entered
    pub fn stage_path(&self) -> Vec<&str> {
        self.history.iter().map(|t| t.stage.as_str()).collect()
    }
}

/// Task creation request
#[derive(Debug, Clone)]
pub struct NewTask {
    pub workflow: String,
    pub target: ResourceRef,
    pub credential: Credential,
    pub params: TaskParams,
    pub parent_id: Option<TaskId>,
    pub reservation: Option<Reservation>,
}

impl NewTask {
    pub fn new(workflow: impl Into<String>, target: ResourceRef, credential: Credential) -> Self {
        Self {
            workflow: workflow.into(),
            target,
            credential,
            params: TaskParams::new(),
            parent_id: None,
            reservation: None,
        }
    }

    pub fn with_params(mut self, params: TaskParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_parent(mut self, parent_id: TaskId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_reservation(mut self, reservation: Option<Reservation>) -> Self {
        self.reservation = reservation;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_lazy_access() {
        let bag = params(json!({
            "guest_id": "g-1",
            "size_mb": 40960,
            "auto_start": true,
        }));

        assert_eq!(bag.require_str("guest_id").unwrap(), "g-1");
        assert_eq!(bag.u64_param("size_mb"), Some(40960));
        assert!(bag.bool_param("auto_start", false));
        assert!(!bag.bool_param("purge", false));
        assert!(matches!(
            bag.require_str("disk_id"),
            Err(Error::ValidationFailed(_))
        ));
        assert_eq!(bag.typed::<u64>("size_mb").unwrap(), Some(40960));
        assert!(bag.typed::<String>("size_mb").is_err());
    }

    #[test]
    fn test_task_error_from_error() {
        let err = TaskError::from(Error::backend("aliyun", "create_vm", "quota"));
        assert_eq!(err.kind, "backend_failure");
        assert!(err.message.contains("create_vm"));
    }

    #[test]
    fn test_record_starts_at_init_stage() {
        let request = NewTask::new(
            "GuestCreateTask",
            ResourceRef::guest("g-1"),
            Credential::new("default", "p1"),
        );
        let record = TaskRecord::new(TaskId::generate(), request, "init");

        assert_eq!(record.status, TaskStatus::Init);
        assert_eq!(record.stage, "init");
        assert_eq!(record.stage_path(), vec!["init"]);
        assert!(!record.is_terminal());
    }
}
