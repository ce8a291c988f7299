//! REST API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use slotsched_core::{
    validate_priority, AllocationId, GroupHandle, JobQueue, QueueStats, ResourceSummary,
    SchedError, TaskSummary, ValidateCommandResourcesResponse,
};
use slotsched_pool::{PoolInfo, ResourceManager};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
pub struct AppState {
    pub manager: ResourceManager,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Create the API router
pub fn create_router(manager: ResourceManager, cors_enabled: bool) -> Router {
    let state = Arc::new(AppState { manager });

    let router = Router::new()
        .route("/api/v1/pools", get(list_pools))
        .route("/api/v1/pools/:pool/resources", get(get_resource_summary))
        .route("/api/v1/pools/:pool/job-queue", get(get_job_queue))
        .route("/api/v1/pools/:pool/queue-stats", get(get_queue_stats))
        .route("/api/v1/pools/:pool/validate", get(validate_command_resources))
        .route(
            "/api/v1/pools/:pool/groups/:group/weight",
            post(set_group_weight),
        )
        .route(
            "/api/v1/pools/:pool/groups/:group/priority",
            post(set_group_priority),
        )
        .route(
            "/api/v1/pools/:pool/groups/:group/max-slots",
            post(set_group_max_slots),
        )
        .route("/api/v1/pools/:pool/groups/:group/move", post(move_job))
        .route("/api/v1/tasks", get(list_tasks))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/status", get(get_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Map a scheduler error to an HTTP status
fn error_response(e: SchedError) -> (StatusCode, String) {
    let status = match e {
        SchedError::TaskNotFound(_) | SchedError::PoolNotFound(_) | SchedError::GroupNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        SchedError::Unsupported(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// List configured resource pools
async fn list_pools(State(state): State<Arc<AppState>>) -> ApiResult<Vec<PoolInfo>> {
    Ok(Json(state.manager.pools()))
}

async fn get_resource_summary(
    State(state): State<Arc<AppState>>,
    Path(pool): Path<String>,
) -> ApiResult<ResourceSummary> {
    let pool = state.manager.pool(&pool).map_err(error_response)?;
    let summary = pool.resource_summary().await.map_err(error_response)?;
    Ok(Json(summary))
}

async fn get_job_queue(
    State(state): State<Arc<AppState>>,
    Path(pool): Path<String>,
) -> ApiResult<JobQueue> {
    let pool = state.manager.pool(&pool).map_err(error_response)?;
    let queue = pool.job_queue().await.map_err(error_response)?;
    Ok(Json(queue))
}

async fn get_queue_stats(
    State(state): State<Arc<AppState>>,
    Path(pool): Path<String>,
) -> ApiResult<QueueStats> {
    let pool = state.manager.pool(&pool).map_err(error_response)?;
    let stats = pool.job_queue_stats().await.map_err(error_response)?;
    Ok(Json(stats))
}

/// Query of a command resource validation
#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub slots: usize,
}

/// Check whether a command needing `slots` can ever be placed
async fn validate_command_resources(
    State(state): State<Arc<AppState>>,
    Path(pool): Path<String>,
    Query(query): Query<ValidateQuery>,
) -> ApiResult<ValidateCommandResourcesResponse> {
    let pool = state.manager.pool(&pool).map_err(error_response)?;
    let response = pool
        .validate_command_resources(query.slots)
        .await
        .map_err(error_response)?;
    Ok(Json(response))
}

/// Request to set a group's fair-share weight
#[derive(Debug, Deserialize)]
pub struct WeightRequest {
    pub weight: f64,
}

async fn set_group_weight(
    State(state): State<Arc<AppState>>,
    Path((pool, group)): Path<(String, GroupHandle)>,
    Json(req): Json<WeightRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !req.weight.is_finite() || req.weight <= 0.0 {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("weight must be positive, got {}", req.weight),
        ));
    }
    info!(pool = %pool, group = %group, weight = req.weight, "Setting group weight");

    let pool = state.manager.pool(&pool).map_err(error_response)?;
    pool.set_group_weight(group, req.weight)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request to set a group's priority
#[derive(Debug, Deserialize)]
pub struct PriorityRequest {
    pub priority: i32,
}

async fn set_group_priority(
    State(state): State<Arc<AppState>>,
    Path((pool, group)): Path<(String, GroupHandle)>,
    Json(req): Json<PriorityRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    validate_priority(req.priority).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    info!(pool = %pool, group = %group, priority = req.priority, "Setting group priority");

    let pool = state.manager.pool(&pool).map_err(error_response)?;
    pool.set_group_priority(group, req.priority)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request to cap a group's slots; `null` removes the cap
#[derive(Debug, Deserialize)]
pub struct MaxSlotsRequest {
    pub max_slots: Option<usize>,
}

async fn set_group_max_slots(
    State(state): State<Arc<AppState>>,
    Path((pool, group)): Path<(String, GroupHandle)>,
    Json(req): Json<MaxSlotsRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    info!(pool = %pool, group = %group, max_slots = ?req.max_slots, "Setting group max slots");

    let pool = state.manager.pool(&pool).map_err(error_response)?;
    pool.set_group_max_slots(group, req.max_slots)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request to move a group's job next to another group's job
#[derive(Debug, Deserialize)]
pub struct MoveJobRequest {
    pub anchor: GroupHandle,
    /// Ahead of the anchor when true, behind it otherwise
    #[serde(default)]
    pub ahead: bool,
}

async fn move_job(
    State(state): State<Arc<AppState>>,
    Path((pool, group)): Path<(String, GroupHandle)>,
    Json(req): Json<MoveJobRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    info!(pool = %pool, group = %group, anchor = %req.anchor, ahead = req.ahead, "Moving job");

    let pool = state.manager.pool(&pool).map_err(error_response)?;
    pool.move_job(group, req.anchor, req.ahead)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// List tasks of every pool
async fn list_tasks(State(state): State<Arc<AppState>>) -> ApiResult<Vec<TaskSummary>> {
    let tasks = state.manager.task_summaries().await.map_err(error_response)?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<TaskSummary> {
    let summary = state
        .manager
        .task_summary(&AllocationId::new(id))
        .await
        .map_err(error_response)?;
    Ok(Json(summary))
}

/// System status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub pools: usize,
    pub tasks: usize,
    pub allocated_tasks: usize,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> ApiResult<StatusResponse> {
    let tasks = state.manager.task_summaries().await.map_err(error_response)?;
    let allocated_tasks = tasks.iter().filter(|t| !t.resources.is_empty()).count();

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        pools: state.manager.pools().len(),
        tasks: tasks.len(),
        allocated_tasks,
    }))
}
