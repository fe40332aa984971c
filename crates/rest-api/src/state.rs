//! Shared handler state

use std::sync::Arc;
use storage_core::{FrontendHelper, Orchestrator};

/// State shared by every REST handler
#[derive(Clone)]
pub struct AppState {
    /// Catalog every handler reads and writes
    pub orchestrator: Arc<dyn Orchestrator>,
    /// Container orchestrator helper for import and upgrade
    pub helper: Option<Arc<dyn FrontendHelper>>,
}

impl AppState {
    /// State without a container orchestrator helper
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            orchestrator,
            helper: None,
        }
    }

    /// Attach the container orchestrator helper
    pub fn with_helper(mut self, helper: Arc<dyn FrontendHelper>) -> Self {
        self.helper = Some(helper);
        self
    }
}
