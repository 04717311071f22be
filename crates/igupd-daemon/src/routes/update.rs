use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use super::RpcResult;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CheckBody {
    #[serde(default)]
    perform_update: bool,
}

/// POST /api/update/check — report the update state, optionally relaunching
/// the installer first.
pub async fn check_update(
    State(app): State<AppState>,
    Json(body): Json<CheckBody>,
) -> Result<Json<RpcResult>, AppError> {
    let result = app.orchestrator.check_update(body.perform_update).await?;
    Ok(Json(RpcResult { result }))
}

#[derive(Deserialize)]
pub struct SnoozeBody {
    seconds: i64,
}

/// POST /api/update/snooze — postpone a scheduled reboot.
pub async fn snooze_update(
    State(app): State<AppState>,
    Json(body): Json<SnoozeBody>,
) -> Result<Json<RpcResult>, AppError> {
    let result = app.orchestrator.snooze(body.seconds).await?;
    Ok(Json(RpcResult { result }))
}
