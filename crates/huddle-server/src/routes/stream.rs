//! Live stream route (SSE).
//!
//! GET /collaborate/{id}/stream opens a Server-Sent Events connection that
//! polls the conversation and pushes snapshot/heartbeat events until the
//! session ends or the connection hits its duration limit.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::{Stream, StreamExt};
use huddle_core::Error;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::services::stream::StreamSettings;
use crate::services::StreamCoordinator;
use crate::state::AppState;

/// Create stream router
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/collaborate/{session_id}/stream", get(open_stream))
}

/// Open the live stream for a session.
///
/// Fails with 409 when the session already has an open stream or is no
/// longer active.
async fn open_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let session = state.sessions.get(&session_id)?;
    if !session.is_active {
        return Err(ApiError(Error::SessionEnded(session_id)));
    }

    let slot = state.streams.try_acquire(&session.id)?;
    info!(session_id = %session.id, "live stream opened");

    let coordinator = StreamCoordinator::new(
        Arc::clone(&state.db),
        Arc::clone(&state.generator),
        slot,
        session.id.clone(),
        StreamSettings {
            poll_interval: state.config.poll_interval,
            max_duration: state.config.max_stream_duration,
            message_window: state.config.message_window,
            entry_window: state.config.entry_window,
        },
    );

    let events = coordinator.into_stream(session).map(|event| {
        let sse_event = Event::default().event(event.name());
        let sse_event = match event.payload() {
            Ok(payload) => sse_event.data(payload),
            // Serialization of our own payload types cannot fail in practice;
            // degrade to an empty data field rather than drop the connection
            Err(_) => sse_event.data("{}"),
        };
        Ok(sse_event)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
