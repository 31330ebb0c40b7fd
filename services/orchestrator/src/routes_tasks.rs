use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use modelops::Modality;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{SubmitOutcome, SubmitRequest, TaskView};
use crate::error::EngineError;
use crate::state::SharedState;

pub async fn submit_task(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitOutcome>), EngineError> {
    let outcome = state.engine.submit(req).await?;
    let code = match outcome {
        SubmitOutcome::Completed { .. } => StatusCode::OK,
        SubmitOutcome::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((code, Json(outcome)))
}

#[derive(Serialize)]
pub struct QueuedResp {
    pub task_id: Uuid,
}

/// Queue without trying the device first.
pub async fn enqueue_task(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<QueuedResp>), EngineError> {
    let task_id = state.engine.enqueue(req).await?;
    Ok((StatusCode::ACCEPTED, Json(QueuedResp { task_id })))
}

pub async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, EngineError> {
    Ok(Json(state.engine.task_status(id).await?))
}

pub async fn get_task_result(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<serde_json::Value>), EngineError> {
    match state.engine.task_result(id).await? {
        Some(result) => Ok((StatusCode::OK, Json(result))),
        None => {
            let view = state.engine.task_status(id).await?;
            let body = serde_json::to_value(view).map_err(|e| EngineError::BadRequest(e.to_string()))?;
            Ok((StatusCode::ACCEPTED, Json(body)))
        }
    }
}

pub async fn retry_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, EngineError> {
    Ok(Json(state.engine.retry(id).await?))
}

pub async fn sync_task(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskView>, EngineError> {
    Ok(Json(state.engine.push_now(id).await?))
}

#[derive(Deserialize)]
pub struct FailedQuery {
    pub limit: Option<u32>,
}

pub async fn list_failed(
    State(state): State<SharedState>,
    Query(q): Query<FailedQuery>,
) -> Result<Json<Vec<TaskView>>, EngineError> {
    let limit = q.limit.unwrap_or(100).min(1000);
    Ok(Json(state.engine.failed_tasks(limit).await?))
}

#[derive(Deserialize)]
pub struct PendingQuery {
    pub kind: Option<Modality>,
}

pub async fn list_pending(
    State(state): State<SharedState>,
    Query(q): Query<PendingQuery>,
) -> Result<Json<Vec<TaskView>>, EngineError> {
    Ok(Json(state.engine.pending_tasks(q.kind).await?))
}

#[derive(Deserialize)]
pub struct PurgeQuery {
    /// Age in hours; defaults to a week.
    pub older_than_hours: Option<u64>,
}

#[derive(Serialize)]
pub struct PurgeResp {
    pub purged: usize,
}

pub async fn purge_synced(
    State(state): State<SharedState>,
    Query(q): Query<PurgeQuery>,
) -> Result<Json<PurgeResp>, EngineError> {
    let hours = q.older_than_hours.unwrap_or(24 * 7);
    let purged = state.engine.purge_synced(Duration::from_secs(hours * 3600)).await?;
    Ok(Json(PurgeResp { purged }))
}
