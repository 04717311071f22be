use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::state::AppState;

/// GET /api/events — SSE stream carrying every `UpdatePending` signal as an
/// `update_pending` event whose data is the integer code.
pub async fn sse_events(State(app): State<AppState>) -> impl axum::response::IntoResponse {
    let rx = app.orchestrator.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| {
        msg.ok().map(|pending| {
            Ok::<Event, Infallible>(
                Event::default()
                    .event("update_pending")
                    .data(pending.code().to_string()),
            )
        })
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
