use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, Json};
use modelops::{Modality, VariantId};
use serde::Serialize;
use taskstore::TaskStoreError;
use thiserror::Error;
use uuid::Uuid;

/// Why the lifecycle controller could not hand out a model.
#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    #[error("model {variant} failed to load: {reason}")]
    LoadFailed { variant: VariantId, reason: String },
    #[error("model {variant} not ready within {waited:?}")]
    TimedOut { variant: VariantId, waited: Duration },
}

/// Why a single inference run did not produce a result. Every variant but
/// `Store` is recovered from by queuing; none reaches a caller as-is.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no inference capacity available")]
    CapacityExceeded,
    #[error("model {variant} failed to load: {reason}")]
    ModelLoad { variant: VariantId, reason: String },
    #[error("{modality} inference timed out after {after:?}")]
    Timeout { modality: Modality, after: Duration },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::CapacityExceeded => "capacity_exceeded",
            DispatchError::ModelLoad { .. } => "model_load_failure",
            DispatchError::Timeout { .. } => "inference_timeout",
            DispatchError::Inference(_) => "inference",
            DispatchError::Store(_) => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote rejected push: HTTP {status}")]
    Rejected { status: u16 },
    #[error("push transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("push timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not build push: {0}")]
    Payload(String),
}

/// Errors callers of the engine can see.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sync delivery failed: {0}")]
    SyncDeliveryFailure(String),
    #[error("task {id} failed permanently after {attempts} attempts")]
    PermanentTaskFailure { id: Uuid, attempts: u32 },
    /// No variant can be loaded. The request was still queued as `task_id`.
    #[error("on-device inference unavailable ({reason}); queued as task {task_id}")]
    Unavailable { task_id: Uuid, reason: String },
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("bad request: {0}")]
    BadRequest(String),
    /// No variant on this device takes the modality; nothing was queued.
    #[error("{0} requests are not served by this device")]
    Unsupported(Modality),
    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

impl From<SyncError> for EngineError {
    fn from(e: SyncError) -> Self {
        EngineError::SyncDeliveryFailure(e.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::SyncDeliveryFailure(_) => "sync_delivery_failure",
            EngineError::PermanentTaskFailure { .. } => "permanent_task_failure",
            EngineError::Unavailable { .. } => "unavailable",
            EngineError::TaskNotFound(_) => "not_found",
            EngineError::BadRequest(_) => "bad_request",
            EngineError::Unsupported(_) => "unsupported_modality",
            EngineError::Store(TaskStoreError::InvalidTransition { .. }) => "invalid_transition",
            EngineError::Store(_) => "storage",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            EngineError::TaskNotFound(_) | EngineError::Store(TaskStoreError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::Store(TaskStoreError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            EngineError::PermanentTaskFailure { .. } | EngineError::Unsupported(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            EngineError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::SyncDeliveryFailure(_) => StatusCode::BAD_GATEWAY,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let task_id = match &self {
            EngineError::Unavailable { task_id, .. } => Some(*task_id),
            EngineError::PermanentTaskFailure { id, .. } | EngineError::TaskNotFound(id) => Some(*id),
            _ => None,
        };
        let body = ApiError { error: self.to_string(), kind: self.kind(), task_id };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_terminal_failures_map_to_error_statuses() {
        let id = Uuid::new_v4();
        let unavailable = EngineError::Unavailable { task_id: id, reason: "small: oom".into() };
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(unavailable.kind(), "unavailable");

        let parked = EngineError::PermanentTaskFailure { id, attempts: 5 };
        assert_eq!(parked.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let conflict = EngineError::Store(TaskStoreError::InvalidTransition {
            id,
            from: taskstore::TaskStatus::Synced,
            to: taskstore::TaskStatus::Pending,
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(conflict.kind(), "invalid_transition");
    }

    #[test]
    fn test_dispatch_kinds_name_the_failure() {
        let timeout = DispatchError::Timeout { modality: Modality::Audio, after: Duration::from_secs(600) };
        assert_eq!(timeout.kind(), "inference_timeout");
        assert_eq!(DispatchError::CapacityExceeded.kind(), "capacity_exceeded");
        let load = DispatchError::ModelLoad { variant: VariantId::Large, reason: "oom".into() };
        assert_eq!(load.kind(), "model_load_failure");
    }
}
