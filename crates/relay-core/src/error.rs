//! Closed gateway error taxonomy and the upstream-cause mapping rules.
//!
//! Every failure that can reach a client is folded into [`ErrorKind`]; the
//! user-visible message comes from a fixed table and never from raw upstream
//! bodies.

use thiserror::Error;

/// Enumerates the closed set of user-visible gateway error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProviderNotAvailable,
    InvalidApiKey,
    RateLimited,
    ProviderError,
    Timeout,
    ContextTooLong,
    BadRequest,
    InsufficientBalance,
    ConversationNotFound,
    Unauthorized,
    UnknownError,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProviderNotAvailable => "PROVIDER_NOT_AVAILABLE",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::RateLimited => "RATE_LIMITED",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ContextTooLong => "CONTEXT_TOO_LONG",
            Self::BadRequest => "BAD_REQUEST",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::ConversationNotFound => "CONVERSATION_NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Fixed user-safe message; upstream bodies never leak through here.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ProviderNotAvailable => "the requested model is not available",
            Self::InvalidApiKey => "invalid API key",
            Self::RateLimited => "rate limited, please retry later",
            Self::ProviderError => "AI service temporarily unavailable",
            Self::Timeout => "the request timed out",
            Self::ContextTooLong => "the conversation is too long for this model",
            Self::BadRequest => "invalid request",
            Self::InsufficientBalance => "insufficient balance",
            Self::ConversationNotFound => "conversation not found",
            Self::Unauthorized => "missing or invalid bearer token",
            Self::UnknownError => "an unexpected error occurred",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::ProviderNotAvailable => 404,
            Self::InvalidApiKey => 401,
            Self::RateLimited => 429,
            Self::ProviderError => 502,
            Self::Timeout => 504,
            Self::ContextTooLong => 400,
            Self::BadRequest => 400,
            Self::InsufficientBalance => 402,
            Self::ConversationNotFound => 404,
            Self::Unauthorized => 401,
            Self::UnknownError => 500,
        }
    }
}

/// Gateway error carrying the mapped kind plus request-path context.
#[derive(Debug, Error)]
#[error("{} ({}): {internal}", kind.code(), provider.as_deref().unwrap_or("-"))]
pub struct RelayError {
    pub kind: ErrorKind,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub request_id: Option<String>,
    pub status_code: Option<u16>,
    internal: String,
}

impl RelayError {
    pub fn new(kind: ErrorKind, internal: impl Into<String>) -> Self {
        Self {
            kind,
            provider: None,
            model: None,
            request_id: None,
            status_code: None,
            internal: internal.into(),
        }
    }

    pub fn kind(kind: ErrorKind) -> Self {
        Self::new(kind, kind.user_message())
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Internal diagnostic message; log-only, never returned to clients.
    pub fn internal_message(&self) -> &str {
        &self.internal
    }

    pub fn user_message(&self) -> &'static str {
        self.kind.user_message()
    }

    /// Maps an upstream HTTP failure into a gateway error with the body kept
    /// internal.
    pub fn from_upstream_status(status: u16, body: &str) -> Self {
        let kind = map_http_status(status, body);
        Self::new(kind, format!("upstream status {status}: {body}")).with_status(status)
    }
}

const CONTEXT_HINTS: [&str; 4] = ["context", "token", "maximum", "length"];

/// Maps an upstream HTTP status (with response body) to an error kind.
pub fn map_http_status(status: u16, body: &str) -> ErrorKind {
    match status {
        401 => ErrorKind::InvalidApiKey,
        429 => ErrorKind::RateLimited,
        400 => {
            let lowered = body.to_ascii_lowercase();
            if CONTEXT_HINTS.iter().any(|hint| lowered.contains(hint)) {
                ErrorKind::ContextTooLong
            } else {
                ErrorKind::BadRequest
            }
        }
        500..=599 => ErrorKind::ProviderError,
        _ => ErrorKind::UnknownError,
    }
}

/// Maps a free-form failure message to an error kind by substring vocabulary.
pub fn map_message(message: &str) -> ErrorKind {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("unauthorized") || lowered.contains("invalid api key") {
        ErrorKind::InvalidApiKey
    } else if lowered.contains("rate limit") {
        ErrorKind::RateLimited
    } else if lowered.contains("timeout") || lowered.contains("timed out") {
        ErrorKind::Timeout
    } else if lowered.contains("context too long") {
        ErrorKind::ContextTooLong
    } else if lowered.contains("not configured") || lowered.contains("no provider") {
        ErrorKind::ProviderNotAvailable
    } else if lowered.contains("service unavailable") {
        ErrorKind::ProviderError
    } else {
        ErrorKind::UnknownError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_http_status_mapping_covers_the_closed_taxonomy() {
        assert_eq!(map_http_status(401, ""), ErrorKind::InvalidApiKey);
        assert_eq!(map_http_status(429, ""), ErrorKind::RateLimited);
        assert_eq!(map_http_status(500, ""), ErrorKind::ProviderError);
        assert_eq!(map_http_status(503, ""), ErrorKind::ProviderError);
        assert_eq!(map_http_status(418, ""), ErrorKind::UnknownError);
    }

    #[test]
    fn unit_http_400_splits_on_context_vocabulary() {
        assert_eq!(
            map_http_status(400, "maximum context LENGTH exceeded"),
            ErrorKind::ContextTooLong
        );
        assert_eq!(
            map_http_status(400, "messages field missing"),
            ErrorKind::BadRequest
        );
    }

    #[test]
    fn unit_message_vocabulary_mapping() {
        assert_eq!(map_message("Rate Limit reached"), ErrorKind::RateLimited);
        assert_eq!(map_message("request timed out"), ErrorKind::Timeout);
        assert_eq!(
            map_message("provider not configured"),
            ErrorKind::ProviderNotAvailable
        );
        assert_eq!(map_message("totally novel failure"), ErrorKind::UnknownError);
    }

    #[test]
    fn regression_provider_error_message_is_sanitised() {
        let error = RelayError::from_upstream_status(502, "stack trace with secrets");
        assert_eq!(error.kind, ErrorKind::ProviderError);
        assert_eq!(error.user_message(), "AI service temporarily unavailable");
        assert!(error.internal_message().contains("stack trace"));
    }

    #[test]
    fn builder_attaches_request_context() {
        let error = RelayError::kind(ErrorKind::RateLimited)
            .with_provider("openai")
            .with_model("gpt-4o")
            .with_request_id("relay-1-1");
        assert_eq!(error.provider.as_deref(), Some("openai"));
        assert_eq!(error.model.as_deref(), Some("gpt-4o"));
        assert_eq!(error.request_id.as_deref(), Some("relay-1-1"));
    }
}
