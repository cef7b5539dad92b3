use history_core::HistoryEngine;
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<HistoryEngine>,
}

impl AppState {
    pub fn new(engine: Arc<HistoryEngine>) -> Self {
        Self { engine }
    }
}
