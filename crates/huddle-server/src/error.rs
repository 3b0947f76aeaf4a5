//! HTTP error mapping for huddle-server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use huddle_core::Error;
use serde::Serialize;
use tracing::{error, warn};

/// Wrapper turning core errors into HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION"),
            Error::SessionNotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            Error::ConversationNotFound(_) => (StatusCode::NOT_FOUND, "CONVERSATION_NOT_FOUND"),
            Error::SessionEnded(_) => (StatusCode::CONFLICT, "SESSION_ENDED"),
            Error::WriteConflict(_) => (StatusCode::CONFLICT, "WRITE_CONFLICT"),
            Error::StreamBusy(_) => (StatusCode::CONFLICT, "STREAM_BUSY"),
            Error::MalformedModelOutput(_) => (StatusCode::BAD_GATEWAY, "MALFORMED_MODEL_OUTPUT"),
            Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM"),
            Error::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };

        if status.is_server_error() {
            error!(%status, "request failed: {}", self.0);
        } else {
            warn!(%status, "request rejected: {}", self.0);
        }

        let body = Json(ErrorResponse {
            error: self.0.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: Error) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_of(Error::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(Error::SessionNotFound("s".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(Error::ConversationNotFound(7)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(Error::SessionEnded("s".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(Error::WriteConflict("s".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(Error::StreamBusy("s".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(Error::MalformedModelOutput("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_of(Error::Upstream("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_of(Error::Other("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
