//! Collaboration session routes.
//!
//! - POST /collaborate - Create a session (or return the active one)
//! - GET /collaborate - List active sessions
//! - GET /collaborate/{id} - Session with its entry log
//! - PATCH /collaborate/{id} - End a session
//! - POST /collaborate/{id}/entries - Log a manual entry

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use huddle_core::types::{Session, SessionEntry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::middleware::AuthContext;
use crate::state::AppState;

/// Create collaborate router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/collaborate", get(list_sessions).post(create_session))
        .route(
            "/collaborate/{session_id}",
            get(get_session).patch(end_session),
        )
        .route("/collaborate/{session_id}/entries", post(add_entry))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub conversation_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsQuery {
    pub conversation_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddEntryRequest {
    pub entry_type: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session: Session,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWithEntriesResponse {
    pub session: Session,
    pub entries: Vec<SessionEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsResponse {
    pub sessions: Vec<Session>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryResponse {
    pub entry: SessionEntry,
}

// ============================================================================
// Handlers
// ============================================================================

/// Create a collaboration session for a conversation, or return the active
/// one. 201 on creation, 200 when an existing session is returned.
async fn create_session(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    let (session, created) = state
        .sessions
        .create_or_get(request.conversation_id, &auth.user_id)?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(SessionResponse { session })))
}

/// List active sessions, optionally scoped to a conversation.
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Json<ListSessionsResponse>> {
    let sessions = state.sessions.list_active(query.conversation_id)?;
    let total = sessions.len();
    Ok(Json(ListSessionsResponse { sessions, total }))
}

/// Get a session with its full entry log (most recent entries first).
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionWithEntriesResponse>> {
    let (session, entries) = state.sessions.get_with_entries(&session_id)?;
    Ok(Json(SessionWithEntriesResponse { session, entries }))
}

/// End a session. Terminal and idempotent.
async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    let session = state.sessions.end(&session_id)?;
    Ok(Json(SessionResponse { session }))
}

/// Log a manual entry; it is also projected into meeting memory.
async fn add_entry(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<AddEntryRequest>,
) -> ApiResult<(StatusCode, Json<EntryResponse>)> {
    let entry = state.sessions.add_entry(
        &session_id,
        &auth.user_id,
        &request.entry_type,
        &request.content,
        request.metadata.as_ref(),
    )?;
    Ok((StatusCode::CREATED, Json(EntryResponse { entry })))
}
