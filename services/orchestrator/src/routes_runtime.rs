use axum::{extract::State, Json};

use crate::engine::SystemStatus;
use crate::error::EngineError;
use crate::state::SharedState;

pub async fn get_status(State(state): State<SharedState>) -> Result<Json<SystemStatus>, EngineError> {
    Ok(Json(state.engine.system_status().await?))
}

pub async fn get_runtime(State(state): State<SharedState>) -> Json<crate::runtime::RuntimeSnapshot> {
    Json(state.engine.dispatcher().runtime().snapshot())
}
