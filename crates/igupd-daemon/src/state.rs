use crate::orchestrator::OrchestratorHandle;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: OrchestratorHandle,
}

impl AppState {
    pub fn new(orchestrator: OrchestratorHandle) -> Self {
        Self { orchestrator }
    }
}
