use axum::extract::State;
use axum::Json;

use super::RpcResult;
use crate::error::AppError;
use crate::state::AppState;

/// POST /api/configuration — apply a configuration document.
///
/// The raw body is the JSON document. Rejected documents are not an HTTP
/// error; they answer `{"result": -1}` like any other refused call.
pub async fn set_configuration(
    State(app): State<AppState>,
    body: String,
) -> Result<Json<RpcResult>, AppError> {
    let result = app.orchestrator.set_configuration(body).await?;
    Ok(Json(RpcResult { result }))
}
