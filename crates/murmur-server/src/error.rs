//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use murmur_core::ChatError;
use thiserror::Error;
use tracing::error;

use crate::metrics;

/// Errors returned by request handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No usable caller identity on the request.
    #[error("Missing or invalid caller identity")]
    Unauthorized,

    /// Caller is not one of the room's participants.
    #[error("Not a participant of room {0}")]
    Forbidden(String),

    /// Client speaks an incompatible protocol version.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Chat operation failed.
    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::UnsupportedVersion(_) => StatusCode::BAD_REQUEST,
            ApiError::Chat(e) if e.is_validation() => StatusCode::BAD_REQUEST,
            ApiError::Chat(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Chat(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::UnsupportedVersion(_) => "version",
            ApiError::Chat(e) if e.is_validation() => "validation",
            ApiError::Chat(e) if e.is_not_found() => "not_found",
            ApiError::Chat(_) => "storage",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        metrics::record_error(self.error_type());

        let message = if status.is_server_error() {
            error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(serde_json::json!({
            "error": message,
            "code": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::RoomIdError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden("3_7".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::from(ChatError::EmptyBody).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::from(ChatError::from(RoomIdError::SelfRoom(4))).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(ChatError::RoomNotFound("1_2".into())).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_error_body() {
        let response = ApiError::from(ChatError::EmptyBody).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], 400);
        assert_eq!(json["error"], "Message body cannot be empty");
    }
}
