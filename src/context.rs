use crate::config::AppConfig;
use crate::core::RunId;
use std::sync::Arc;
use std::time::Instant;

/// Per-run state handed to every stage.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub run_id: RunId,
    pub started_at: Instant,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            run_id: RunId::new(),
            started_at: Instant::now(),
        }
    }
}
