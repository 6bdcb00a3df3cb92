//! Axum route handlers for the wrapped RPC API.

use crate::aux_stats::AuxClients;
use crate::db::Db;
use crate::groups;
use crate::slack_api::SlackApi;
use crate::worker::WorkerPool;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use wrapped_types::{
    JobMode, JobStatus, JoinWaitlistRequest, QueuePosition, RpcResponse, ServiceStatus,
    TopChannel, TopDm, UploadRequest, UploadSecret, UserIdRequest, WorkerStatus, WrappedData,
    WrappedStats,
};

pub struct AppState {
    pub db: Arc<Db>,
    /// Interactive client with a small retry budget; the worker pool holds
    /// its own client with the large one.
    pub api: Arc<SlackApi>,
    pub workers: Arc<WorkerPool>,
    pub aux: AuxClients,
    pub start_time: Instant,
}

#[derive(Debug, Deserialize)]
pub struct UserIdQuery {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct WrappedQuery {
    pub user_id: String,
    pub custom_hackatime: Option<String>,
}

// =====================================================
// Waitlist Endpoints
// =====================================================

// POST /rpc/waitlist/join
pub async fn waitlist_join(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinWaitlistRequest>,
) -> (StatusCode, Json<RpcResponse<QueuePosition>>) {
    if req.user_id.trim().is_empty() || req.credential.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(RpcResponse::err("user_id and credential are required")),
        );
    }

    let platform_user_id = req
        .platform_user_id
        .clone()
        .unwrap_or_else(|| req.user_id.clone());
    let mode = req.mode.unwrap_or(JobMode::Default);

    match state.db.enqueue(
        &req.user_id,
        &platform_user_id,
        &req.credential,
        mode,
        req.github_handle.as_deref(),
    ) {
        Ok(added) => {
            if added {
                log::info!("[WRAPPED] {} joined the waitlist ({})", req.user_id, mode.as_str());
            }
            // Kick the worker; a no-op when a run is already active
            state.workers.start_run();
            match state.db.position(&req.user_id) {
                Ok(Some(pos)) => (StatusCode::OK, Json(RpcResponse::ok(pos))),
                Ok(None) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(RpcResponse::err("Job missing after enqueue")),
                ),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(RpcResponse::err(format!("Failed to read position: {}", e))),
                ),
            }
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to join waitlist: {}", e))),
        ),
    }
}

// GET /rpc/waitlist/position
pub async fn waitlist_position(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserIdQuery>,
) -> (StatusCode, Json<RpcResponse<QueuePosition>>) {
    match state.db.position(&q.user_id) {
        Ok(Some(pos)) => (StatusCode::OK, Json(RpcResponse::ok(pos))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err("No waitlist entry for that user")),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to read position: {}", e))),
        ),
    }
}

// =====================================================
// Worker Endpoints
// =====================================================

// POST /rpc/worker/run
pub async fn worker_run(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<WorkerStatus>>) {
    if state.workers.start_run() {
        log::info!("[WRAPPED] Worker run started");
    }
    worker_status(State(state)).await
}

// GET /rpc/worker/status
pub async fn worker_status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<WorkerStatus>>) {
    match state.db.size(None) {
        Ok(queue_size) => (
            StatusCode::OK,
            Json(RpcResponse::ok(WorkerStatus {
                queue_size,
                is_running: state.workers.is_running(),
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to read queue size: {}", e))),
        ),
    }
}

// =====================================================
// Wrapped Data Endpoints
// =====================================================

// GET /rpc/wrapped/get
pub async fn wrapped_get(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WrappedQuery>,
) -> (StatusCode, Json<RpcResponse<WrappedData>>) {
    let job = match state.db.get_job(&q.user_id) {
        Ok(Some(job)) => job,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(RpcResponse::err("No wrapped found for that user")),
            )
        }
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RpcResponse::err(format!("Lookup failed: {}", e))),
            )
        }
    };

    if job.status != JobStatus::Completed {
        return (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err("Data not ready")),
        );
    }
    let Some(stats) = job
        .result_json
        .as_deref()
        .and_then(|j| serde_json::from_str::<WrappedStats>(j).ok())
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err("Data not ready")),
        );
    };

    if let Err(e) = state.db.update_global_stats(&job.user_id, stats.total_messages) {
        log::warn!("[WRAPPED] Global stats update failed for {}: {}", job.user_id, e);
    }

    // Display name via the bot pool, best-effort
    let mut user_name = "Hack Clubber".to_string();
    if let Some(token) = state.api.pool().first() {
        if let Ok(Some(info)) = state.api.user_info(token, &job.platform_user_id).await {
            user_name = info.display_name().to_string();
        }
    }

    let hackatime_id = q.custom_hackatime.as_deref().unwrap_or(&job.platform_user_id);
    let tracked_hours = state.aux.tracked_hours(hackatime_id).await;
    let (project_submissions, project_names) = match job.github_handle.as_deref() {
        Some(handle) => state.aux.project_submissions(handle).await,
        None => (0, Vec::new()),
    };

    let mut top_channels = stats.top_channels;
    if top_channels.is_empty() {
        top_channels.push(TopChannel {
            name: "general".to_string(),
            rank: 1,
        });
    }
    let mut top_dms = stats.top_dms;
    if top_dms.is_empty() {
        top_dms.push(TopDm {
            name: "Unknown :(".to_string(),
            count: 0,
            image: None,
        });
    }

    let data = WrappedData {
        user_name,
        total_messages: stats.total_messages,
        top_channels,
        top_dms,
        confessions_messages: stats.confessions_messages,
        meta_messages: stats.meta_messages,
        prox_messages: stats.prox_messages,
        tracked_hours,
        project_submissions,
        project_names,
        group_name: groups::group_for(&q.user_id).to_string(),
    };

    (StatusCode::OK, Json(RpcResponse::ok(data)))
}

// POST /rpc/wrapped/delete
pub async fn wrapped_delete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserIdRequest>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    match state.db.remove_user(&req.user_id) {
        Ok(true) => {
            log::info!("[WRAPPED] Deleted all data for {}", req.user_id);
            (StatusCode::OK, Json(RpcResponse::ok(true)))
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(RpcResponse::err("No data for that user")),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to delete: {}", e))),
        ),
    }
}

// =====================================================
// Upload Endpoints
// =====================================================

// POST /rpc/secret/generate
pub async fn secret_generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UserIdRequest>,
) -> (StatusCode, Json<RpcResponse<UploadSecret>>) {
    if req.user_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(RpcResponse::err("user_id is required")),
        );
    }
    match state.db.generate_upload_secret(&req.user_id) {
        Ok(secret) => (StatusCode::OK, Json(RpcResponse::ok(UploadSecret { secret }))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Failed to generate secret: {}", e))),
        ),
    }
}

// POST /rpc/upload
pub async fn upload(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UploadRequest>,
) -> (StatusCode, Json<RpcResponse<bool>>) {
    match state
        .db
        .complete_upload(&req.secret, &req.data, req.github_handle.as_deref())
    {
        Ok(true) => (StatusCode::OK, Json(RpcResponse::ok(true))),
        Ok(false) => (
            StatusCode::BAD_REQUEST,
            Json(RpcResponse::err("Invalid secret")),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RpcResponse::err(format!("Upload failed: {}", e))),
        ),
    }
}

// =====================================================
// Service Endpoints
// =====================================================

// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    let status = ServiceStatus {
        running: true,
        uptime_secs: state.start_time.elapsed().as_secs(),
        queue_size: state.db.size(None).unwrap_or(0),
        completed_jobs: state.db.completed_count().unwrap_or(0),
        worker_running: state.workers.is_running(),
    };
    (StatusCode::OK, Json(RpcResponse::ok(status)))
}
