//! HTTP facade for the outreach task-execution engine
//!
//! A thin wrapper over `TaskManager`: each handler validates the caller,
//! deserialises its request, calls straight through to the manager, and
//! maps the result onto the wire. No business logic — batching, scheduling
//! and state-machine transitions all live in `engine-core` (§6).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use engine_core::manager::TaskManager;
use engine_core::session_pool::BrowserBackend;
use engine_shared::error::EngineError;
use engine_shared::task::{Paging, SortKey, TaskFilters, TaskStatus};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Sliding-window rate limiter keyed by the caller identity in
/// `X-Created-By` rather than an agent id — one outreach task-execution
/// engine serves many callers submitting on behalf of different users, not
/// many agents reporting to one server.
pub struct CallerRateLimiter {
    limits: Arc<RwLock<HashMap<String, Vec<Instant>>>>,
    window: Duration,
    max_requests: usize,
}

impl CallerRateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self { limits: Arc::new(RwLock::new(HashMap::new())), window, max_requests }
    }

    pub async fn check(&self, caller: &str) -> Result<(), ApiError> {
        let now = Instant::now();
        let mut limits = self.limits.write().await;
        let requests = limits.entry(caller.to_string()).or_default();
        requests.retain(|&t| now.duration_since(t) < self.window);

        if requests.len() >= self.max_requests {
            warn!(caller, count = requests.len(), max = self.max_requests, "rate limit exceeded");
            return Err(ApiError::TooManyRequests);
        }
        requests.push(now);
        Ok(())
    }

    /// Drops callers with no requests inside the window, so a burst of
    /// one-off callers doesn't grow this map forever.
    pub async fn cleanup_stale_entries(&self) {
        let mut limits = self.limits.write().await;
        let now = Instant::now();
        limits.retain(|_, timestamps| {
            timestamps.retain(|&t| now.duration_since(t) < self.window);
            !timestamps.is_empty()
        });
    }
}

impl Clone for CallerRateLimiter {
    fn clone(&self) -> Self {
        Self { limits: Arc::clone(&self.limits), window: self.window, max_requests: self.max_requests }
    }
}

pub struct AppState<B: BrowserBackend + 'static> {
    pub manager: Arc<TaskManager<B>>,
    pub api_key: Arc<String>,
    pub rate_limiter: CallerRateLimiter,
    pub default_page_size: usize,
}

/// Written by hand rather than derived: `#[derive(Clone)]` would add a
/// spurious `B: Clone` bound even though `B` only ever appears behind an
/// `Arc`.
impl<B: BrowserBackend + 'static> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            api_key: Arc::clone(&self.api_key),
            rate_limiter: self.rate_limiter.clone(),
            default_page_size: self.default_page_size,
        }
    }
}

impl<B: BrowserBackend + 'static> AppState<B> {
    pub fn new(
        manager: Arc<TaskManager<B>>,
        api_key: String,
        rate_limit_window: Duration,
        rate_limit_max_requests: usize,
        default_page_size: usize,
    ) -> Self {
        Self {
            manager,
            api_key: Arc::new(api_key),
            rate_limiter: CallerRateLimiter::new(rate_limit_window, rate_limit_max_requests),
            default_page_size,
        }
    }
}

pub fn create_router<B: BrowserBackend + 'static>(state: AppState<B>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/status", get(status::<B>))
        .route("/api/v1/tasks", post(submit::<B>))
        .route("/api/v1/tasks", get(list::<B>))
        .route("/api/v1/tasks/summary", get(summary::<B>))
        .route("/api/v1/tasks/{task_id}", get(get_task::<B>))
        .route("/api/v1/tasks/{task_id}", put(update::<B>))
        .route("/api/v1/tasks/{task_id}/rename", post(rename::<B>))
        .route("/api/v1/tasks/{task_id}/run-now", post(run_now::<B>))
        .route("/api/v1/tasks/{task_id}/cancel", post(cancel::<B>))
        .route("/api/v1/tasks/{task_id}/force-cancel", post(force_cancel::<B>))
        .with_state(state)
}

const API_KEY_HEADER: &str = "x-api-key";
const CREATED_BY_HEADER: &str = "x-created-by";

/// Constant-time comparison against the configured key, matching the
/// teacher's `validate_api_key` (§ambient observability surface). A blank
/// configured key disables auth entirely — useful for local development.
fn validate_api_key(headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    use subtle::ConstantTimeEq;

    if expected_key.is_empty() {
        return Ok(());
    }

    let provided = match headers.get(API_KEY_HEADER) {
        Some(v) => v.to_str().map_err(|_| ApiError::Unauthorized)?,
        None => return Err(ApiError::Unauthorized),
    };

    let provided_bytes = provided.as_bytes();
    let expected_bytes = expected_key.as_bytes();
    let matches = provided_bytes.len() == expected_bytes.len() && bool::from(provided_bytes.ct_eq(expected_bytes));
    if !matches {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

fn created_by(headers: &HeaderMap) -> String {
    headers.get(CREATED_BY_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("api").to_string()
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "engine-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Admin/observability surface (SPEC_FULL §4 [AMBIENT]): a snapshot of the
/// Account Pool's sharing state plus the live session count, not gated
/// behind the API key since it carries no task payload data.
async fn status<B: BrowserBackend + 'static>(State(state): State<AppState<B>>) -> impl IntoResponse {
    let summary = state.manager.summary().await.unwrap_or_default();
    let accounts = state.manager.account_status();
    let (sessions_live, sessions_max) = state.manager.session_pool_status().await;
    Json(serde_json::json!({
        "tasks": summary,
        "accounts": accounts,
        "sessions": { "live": sessions_live, "max": sessions_max },
    }))
}

#[derive(serde::Deserialize)]
struct ListParams {
    region: Option<String>,
    status: Option<String>,
    name: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn list<B: BrowserBackend + 'static>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_api_key(&headers, &state.api_key)?;

    let status = match params.status {
        Some(raw) => Some(parse_status(&raw)?),
        None => None,
    };
    let filters = TaskFilters {
        brand_substring: None,
        region: params.region,
        status,
        name_substring: params.name,
        run_at_time_after: None,
        run_end_time_before: None,
    };
    let paging = Paging::clipped(params.page.unwrap_or(1), params.page_size.unwrap_or(state.default_page_size));

    let (page, total) = state.manager.list(&filters, SortKey::SubmittedDesc, paging).await.map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({ "items": page, "total": total })))
}

async fn summary<B: BrowserBackend + 'static>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
) -> Result<Json<engine_shared::task::TaskSummary>, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    Ok(Json(state.manager.summary().await.map_err(ApiError::from)?))
}

async fn submit<B: BrowserBackend + 'static>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    let caller = created_by(&headers);
    state.rate_limiter.check(&caller).await?;

    let payload: engine_shared::TaskPayload =
        serde_json::from_value(body).map_err(|e| ApiError::BadRequest(format!("invalid payload: {e}")))?;

    let task_id = state.manager.submit(payload, &caller).await.map_err(ApiError::from)?;
    info!(task_id = %task_id, caller = %caller, "submitted task");
    Ok(Json(serde_json::json!({ "task_id": task_id })))
}

async fn get_task<B: BrowserBackend + 'static>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<engine_shared::TaskSnapshot>, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    match state.manager.get(&task_id).await.map_err(ApiError::from)? {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(ApiError::NotFound(task_id)),
    }
}

async fn update<B: BrowserBackend + 'static>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(patch): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    state.manager.update(&task_id, &patch).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(serde::Deserialize)]
struct RenameBody {
    task_name: String,
}

async fn rename<B: BrowserBackend + 'static>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<StatusCode, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    state.manager.rename(&task_id, &body.task_name).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_now<B: BrowserBackend + 'static>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    state.manager.run_now(&task_id).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel<B: BrowserBackend + 'static>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    let cancelled = state.manager.cancel(&task_id).await.map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

async fn force_cancel<B: BrowserBackend + 'static>(
    State(state): State<AppState<B>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_api_key(&headers, &state.api_key)?;
    let cancelled = state.manager.force_cancel(&task_id).await.map_err(ApiError::from)?;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

fn parse_status(raw: &str) -> Result<TaskStatus, ApiError> {
    match raw {
        "pending" => Ok(TaskStatus::Pending),
        "to-be-run" => Ok(TaskStatus::ToBeRun),
        "running" => Ok(TaskStatus::Running),
        "to-be-cancel" => Ok(TaskStatus::ToBeCancel),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "cancelled" => Ok(TaskStatus::Cancelled),
        other => Err(ApiError::BadRequest(format!("unknown status '{other}'"))),
    }
}

/// Maps the `EngineError` taxonomy onto the wire (§7): validation-class
/// errors surface as `4xx`, everything else that should never reach this
/// layer (driver/persistence/deadline/cancellation errors are all swallowed
/// inside the scheduler) falls back to `500`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not pending: {0}")]
    NotPending(String),
    #[error("directory collision: {0}")]
    CollidingDir(String),
    #[error("too many requests")]
    TooManyRequests,
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidPayload(msg) => ApiError::BadRequest(msg),
            EngineError::DuplicateId(id) => ApiError::BadRequest(format!("duplicate task id: {id}")),
            EngineError::NotFound(id) => ApiError::NotFound(id),
            EngineError::NotPending(id) => ApiError::NotPending(id),
            EngineError::CollidingDir(dir) => ApiError::CollidingDir(dir),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotPending(_) => StatusCode::CONFLICT,
            ApiError::CollidingDir(_) => StatusCode::CONFLICT,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
