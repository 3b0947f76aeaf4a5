//! Authentication middleware for huddle-server.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

pub use huddle_core::auth::AuthContext;

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    MissingUserId,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error, code) = match self {
            AuthError::MissingToken => (
                StatusCode::UNAUTHORIZED,
                "Missing authentication token",
                "MISSING_TOKEN",
            ),
            AuthError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "Invalid authentication token",
                "INVALID_TOKEN",
            ),
            AuthError::MissingUserId => (
                StatusCode::UNAUTHORIZED,
                "Missing user ID header",
                "MISSING_USER_ID",
            ),
        };

        let body = Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

/// Authentication middleware for axum
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    // Extract token from header
    let token_header = request
        .headers()
        .get("X-Huddle-Service-Token")
        .or_else(|| request.headers().get("Authorization"));

    let token_str = match token_header {
        Some(value) => value.to_str().map_err(|_| AuthError::InvalidToken)?,
        None => return Err(AuthError::MissingToken),
    };

    // Remove "Bearer " prefix if present
    let token_str = token_str.trim_start_matches("Bearer ").trim();

    // Decode token
    let token_bytes = STANDARD
        .decode(token_str)
        .map_err(|_| AuthError::InvalidToken)?;

    if !state.service_token.verify(&token_bytes) {
        return Err(AuthError::InvalidToken);
    }

    // The frontend holds the real session; the acting user travels as a header
    let user_id = request
        .headers()
        .get("X-Huddle-User-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(AuthError::MissingUserId)?;

    request.extensions_mut().insert(AuthContext { user_id });

    Ok(next.run(request).await)
}
