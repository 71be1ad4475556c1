use std::sync::Arc;

use application::RelayEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RelayEngine>,
}

impl AppState {
    pub fn new(engine: Arc<RelayEngine>) -> Self {
        Self { engine }
    }
}
