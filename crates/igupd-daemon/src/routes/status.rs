use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::orchestrator::StatusSnapshot;
use crate::state::AppState;

/// GET /api/status
pub async fn get_status(State(app): State<AppState>) -> Result<Json<StatusSnapshot>, AppError> {
    Ok(Json(app.orchestrator.status().await?))
}
