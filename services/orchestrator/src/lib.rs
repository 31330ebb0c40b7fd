//! Adaptive on-device inference with an offline task queue behind it.
//!
//! The [`engine::Engine`] is the entry point: it picks a model variant for
//! the current load, runs the request under a concurrency cap, and queues
//! whatever cannot run now for the [`drainer::Drainer`] to finish and push.

pub mod config;
pub mod connectivity;
pub mod dispatcher;
pub mod drainer;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod provider;
pub mod provider_model_server;
pub mod provider_ollama;
pub mod routes_models;
pub mod routes_runtime;
pub mod routes_tasks;
pub mod runtime;
pub mod state;
pub mod sync;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;

pub use state::{AppState, SharedState};

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/tasks", post(routes_tasks::submit_task))
        .route("/tasks/queue", post(routes_tasks::enqueue_task))
        .route("/tasks/pending", get(routes_tasks::list_pending))
        .route("/tasks/failed", get(routes_tasks::list_failed))
        .route("/tasks/synced", delete(routes_tasks::purge_synced))
        .route("/tasks/:id", get(routes_tasks::get_task))
        .route("/tasks/:id/result", get(routes_tasks::get_task_result))
        .route("/tasks/:id/retry", post(routes_tasks::retry_task))
        .route("/tasks/:id/sync", post(routes_tasks::sync_task))
        .route("/status", get(routes_runtime::get_status))
        .route("/runtime", get(routes_runtime::get_runtime))
        .route("/models", get(routes_models::list_models))
        .route("/models/override", put(routes_models::put_override))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
