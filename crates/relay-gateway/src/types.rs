//! Gateway error/response plumbing shared across handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::{ErrorKind, RelayError};
use serde_json::{json, Value};

/// HTTP-facing error; the body is OpenAI-shaped and the message always comes
/// from the fixed user-safe table.
#[derive(Debug)]
pub struct GatewayApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl GatewayApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::BadRequest.code(), message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorKind::Unauthorized.code(),
            ErrorKind::Unauthorized.user_message(),
        )
    }
}

impl From<RelayError> for GatewayApiError {
    fn from(error: RelayError) -> Self {
        let status = StatusCode::from_u16(error.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        tracing::warn!(
            code = error.kind.code(),
            provider = error.provider.as_deref().unwrap_or("-"),
            model = error.model.as_deref().unwrap_or("-"),
            request_id = error.request_id.as_deref().unwrap_or("-"),
            internal = error.internal_message(),
            "request failed"
        );
        Self {
            status,
            code: error.kind.code(),
            message: error.user_message().to_string(),
        }
    }
}

impl IntoResponse for GatewayApiError {
    fn into_response(self) -> Response {
        let error_type = if self.status.is_client_error() {
            "invalid_request_error"
        } else {
            "server_error"
        };
        (
            self.status,
            Json(json!({
                "error": {
                    "type": error_type,
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

/// One outbound SSE frame.
#[derive(Debug)]
pub enum SseFrame {
    /// Unnamed `data:` frame (OpenAI style).
    Data(Value),
    /// Named event frame (Anthropic style).
    Event { event: &'static str, payload: Value },
    /// The OpenAI `[DONE]` sentinel.
    Done,
}

impl SseFrame {
    pub fn into_event(self) -> axum::response::sse::Event {
        match self {
            Self::Data(payload) => axum::response::sse::Event::default().data(payload.to_string()),
            Self::Event { event, payload } => axum::response::sse::Event::default()
                .event(event)
                .data(payload.to_string()),
            Self::Done => axum::response::sse::Event::default().data("[DONE]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_errors_map_status_and_hide_internals() {
        let error = RelayError::new(ErrorKind::ProviderError, "raw upstream panic dump");
        let api: GatewayApiError = error.into();
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
        assert_eq!(api.code, "PROVIDER_ERROR");
        assert_eq!(api.message, "AI service temporarily unavailable");
    }

    #[test]
    fn unauthorized_shape_is_stable() {
        let api = GatewayApiError::unauthorized();
        assert_eq!(api.status, StatusCode::UNAUTHORIZED);
        assert_eq!(api.code, "UNAUTHORIZED");
    }
}
