use std::sync::Arc;

use crate::engine::Engine;

pub type SharedState = Arc<AppState>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}
