use crate::{config::AppConfig, engine::FleetEngine};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: FleetEngine,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, engine: FleetEngine) -> Self {
        Self { config, engine }
    }
}
