//! REST API Handlers
//!
//! Thin handlers over the guest orchestrator. The caller's credential comes
//! from the `X-Domain-Id`, `X-Project-Id` and `X-User-Id` headers.

use crate::controlplane::{Accepted, GuestOrchestrator};
use crate::domain::ports::{Credential, ResourceRef, ServerCreateInput};
use crate::error::Error;
use crate::task::record::{TaskId, TaskRecord, TaskStatus};
use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

pub const DOMAIN_HEADER: &str = "x-domain-id";
pub const PROJECT_HEADER: &str = "x-project-id";
pub const USER_HEADER: &str = "x-user-id";

const DEFAULT_DOMAIN: &str = "default";

// =============================================================================
// Request/Response Types
// =============================================================================

/// Change config request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeConfigRequest {
    #[serde(default)]
    pub vcpu_count: Option<u32>,
    #[serde(default)]
    pub vmem_size_mb: Option<u64>,
}

/// Delete query parameters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub purge: bool,
}

/// Accepted operation response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub task_id: String,
    pub workflow: String,
    pub resource: ResourceRef,
}

/// Task list entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub workflow: String,
    pub stage: String,
    pub status: TaskStatus,
    pub parent_id: Option<String>,
    pub target: ResourceRef,
}

impl From<&TaskRecord> for TaskSummary {
    fn from(record: &TaskRecord) -> Self {
        Self {
            task_id: record.id.to_string(),
            workflow: record.name.clone(),
            stage: record.stage.clone(),
            status: record.status,
            parent_id: record.parent_id.as_ref().map(|p| p.to_string()),
            target: record.target.clone(),
        }
    }
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Error wrapper mapping the error taxonomy onto HTTP statuses
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// HTTP status for an error
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::ValidationFailed(_)
        | Error::UnknownWorkflow { .. }
        | Error::StageNotFound { .. }
        | Error::JsonParse(_)
        | Error::YamlParse(_) => StatusCode::BAD_REQUEST,
        Error::ResourceNotFound { .. }
        | Error::TaskNotFound { .. }
        | Error::ReservationNotFound { .. }
        | Error::DriverNotFound { .. } => StatusCode::NOT_FOUND,
        Error::InvalidState { .. } | Error::TaskTerminal { .. } | Error::ResourceExists { .. } => {
            StatusCode::CONFLICT
        }
        Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED {
            error!("Request failed: {}", self.0);
        } else {
            debug!(kind = self.0.kind(), "Request rejected: {}", self.0);
        }

        (
            status,
            Json(ApiErrorResponse {
                error: self.0.kind().to_string(),
                message: self.0.to_string(),
                details: None,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Credential from the identity headers; the project is mandatory
pub fn credential_from_headers(headers: &HeaderMap) -> ApiResult<Credential> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let project_id = header(PROJECT_HEADER).ok_or_else(|| {
        Error::ValidationFailed(format!("missing {} header", PROJECT_HEADER))
    })?;
    let domain_id = header(DOMAIN_HEADER).unwrap_or(DEFAULT_DOMAIN);

    let mut credential = Credential::new(domain_id, project_id);
    if let Some(user_id) = header(USER_HEADER) {
        credential = credential.with_user(user_id, user_id);
    }
    Ok(credential)
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<GuestOrchestrator>,
}

impl RestRouter {
    pub fn new(orchestrator: Arc<GuestOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Guest endpoints
            .route("/v1/guests", post(create_guest))
            .route("/v1/guests/:id", get(get_guest).delete(delete_guest))
            .route("/v1/guests/:id/config", post(change_config))
            // Task endpoints
            .route("/v1/tasks", get(list_tasks))
            .route("/v1/tasks/:id", get(get_task))
            .route("/v1/tasks/:id/cancel", post(cancel_task))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<GuestOrchestrator>,
}

async fn accepted(accepted: Accepted) -> ApiResult<Response> {
    let record = accepted.task.record().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            task_id: record.id.to_string(),
            workflow: record.name,
            resource: accepted.resource,
        }),
    )
        .into_response())
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn create_guest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<ServerCreateInput>,
) -> ApiResult<Response> {
    let credential = credential_from_headers(&headers)?;
    let result = state.orchestrator.create_guest(&credential, input).await?;
    accepted(result).await
}

pub async fn get_guest(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let guest = state.orchestrator.get_guest(&id).await?;
    Ok((StatusCode::OK, Json(guest)).into_response())
}

pub async fn delete_guest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Response> {
    let credential = credential_from_headers(&headers)?;
    let result = state
        .orchestrator
        .delete_guest(&credential, &id, query.purge)
        .await?;
    accepted(result).await
}

pub async fn change_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<ChangeConfigRequest>,
) -> ApiResult<Response> {
    let credential = credential_from_headers(&headers)?;
    let result = state
        .orchestrator
        .change_config(&credential, &id, request.vcpu_count, request.vmem_size_mb)
        .await?;
    accepted(result).await
}

pub async fn list_tasks(State(state): State<AppState>) -> ApiResult<Response> {
    let records = state.orchestrator.engine().list().await?;
    let tasks: Vec<TaskSummary> = records.iter().map(TaskSummary::from).collect();
    Ok((StatusCode::OK, Json(tasks)).into_response())
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let record = state.orchestrator.engine().get(&TaskId::from(id)).await?;
    Ok((StatusCode::OK, Json(record)).into_response())
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = TaskId::from(id);
    state.orchestrator.engine().cancel(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "taskId": id.to_string(), "cancelRequested": true })),
    )
        .into_response())
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.orchestrator.engine().workflows().is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no workflows registered")
    } else {
        (StatusCode::OK, "ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::{ControlPlane, OrchestratorConfig};
    use crate::domain::model::MemoryGuestStore;
    use crate::domain::ports::{providers, DiskConfig};
    use crate::drivers::DriverEnvironment;
    use crate::task::engine::TaskEngine;
    use crate::task::retry::StageRetry;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        let env = DriverEnvironment::simulated(StageRetry::none(), Duration::ZERO);
        let plane = ControlPlane::assemble(
            &env,
            &[providers::ALIYUN.to_string()],
            Arc::new(MemoryGuestStore::new()),
            TaskEngine::builder(),
            OrchestratorConfig::default(),
        )
        .unwrap();
        AppState {
            orchestrator: plane.orchestrator,
        }
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(PROJECT_HEADER, HeaderValue::from_static("p1"));
        headers.insert(USER_HEADER, HeaderValue::from_static("u1"));
        headers
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&Error::ValidationFailed("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::InvalidState {
                resource: "guest/g".into(),
                status: "running".into(),
                operation: "resize_disk".into(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::not_implemented("azure", "rebuild_root_status")),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            status_for(&Error::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_credential_headers() {
        let credential = credential_from_headers(&headers()).unwrap();
        assert_eq!(credential.domain_id, DEFAULT_DOMAIN);
        assert_eq!(credential.project_id, "p1");
        assert_eq!(credential.user_id, "u1");

        let err = credential_from_headers(&HeaderMap::new()).unwrap_err();
        assert_eq!(status_for(&err.0), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_guest_is_accepted() {
        let input = ServerCreateInput {
            name: "api-vm".into(),
            provider: providers::ALIYUN.into(),
            vcpu_count: 1,
            vmem_size_mb: 1024,
            disks: vec![DiskConfig::new(40 * 1024)],
            ..Default::default()
        };
        let response = create_guest(State(state()), headers(), Json(input))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_unknown_guest_is_not_found() {
        let err = get_guest(State(state()), Path("guest-missing".into()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_undersized_disk_is_bad_request() {
        let input = ServerCreateInput {
            name: "api-vm".into(),
            provider: providers::ALIYUN.into(),
            vcpu_count: 1,
            vmem_size_mb: 1024,
            disks: vec![DiskConfig::new(10 * 1024)],
            ..Default::default()
        };
        let err = create_guest(State(state()), headers(), Json(input))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_router_serves_routes() {
        let router = RestRouter::new(state().orchestrator).build();

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/v1/guests/guest-missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
