use axum::{extract::State, Json};
use modelops::{ModelVariantDescriptor, VariantId};
use serde::{Deserialize, Serialize};

use crate::state::SharedState;

#[derive(Serialize)]
pub struct VariantView {
    #[serde(flatten)]
    pub descriptor: ModelVariantDescriptor,
    pub supported_on_device: bool,
}

#[derive(Serialize)]
pub struct ModelsResp {
    pub variants: Vec<VariantView>,
    pub model_override: Option<VariantId>,
}

pub async fn list_models(State(state): State<SharedState>) -> Json<ModelsResp> {
    let d = state.engine.dispatcher();
    let variants = d
        .catalog()
        .iter()
        .map(|v| VariantView {
            descriptor: v.clone(),
            supported_on_device: d.profile().supports(v.id),
        })
        .collect();
    Json(ModelsResp { variants, model_override: d.override_variant() })
}

#[derive(Deserialize)]
pub struct OverrideReq {
    /// `null` clears the override.
    pub variant: Option<VariantId>,
}

#[derive(Serialize)]
pub struct OverrideResp {
    pub model_override: Option<VariantId>,
}

pub async fn put_override(
    State(state): State<SharedState>,
    Json(req): Json<OverrideReq>,
) -> Json<OverrideResp> {
    state.engine.set_override(req.variant);
    tracing::info!(variant = ?req.variant, "model override set");
    Json(OverrideResp { model_override: req.variant })
}
