//! The closed stream-event variant shared by every provider path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Uniform representation of one step of a streamed model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Producer has begun; always the first event of a stream.
    Start,
    /// Incremental assistant text; concatenation across the stream is the
    /// final message.
    Content { text: String },
    /// Parsed in-band tool invocation surfaced by the packager.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Token accounting; at most once per stream, before `Done`.
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
    /// Producer finished normally; always last on a non-error stream.
    Done,
    /// Terminal failure; no events follow.
    Error { message: String },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// Running token accounting accumulated while decoding a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }

    pub fn recompute_total(&mut self) {
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }

    pub fn into_event(self) -> StreamEvent {
        StreamEvent::Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

/// Failures while decoding a provider chunk.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed provider chunk: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("provider stream error: {0}")]
    Upstream(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(StreamEvent::Done.is_terminal());
        assert!(StreamEvent::error("boom").is_terminal());
        assert!(!StreamEvent::Start.is_terminal());
        assert!(!StreamEvent::content("hi").is_terminal());
    }

    #[test]
    fn usage_event_round_trips_through_serde_tagging() {
        let event = TokenUsage {
            prompt_tokens: 5,
            completion_tokens: 4,
            total_tokens: 9,
        }
        .into_event();
        let raw = serde_json::to_string(&event).expect("serialize");
        assert!(raw.contains("\"type\":\"usage\""));
        let back: StreamEvent = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back, event);
    }
}
