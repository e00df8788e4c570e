//! Decoder for OpenAI chat-completion stream chunks.
//!
//! Also serves DeepSeek and OpenRouter, whose streams use the same wire
//! shape. The `[DONE]` sentinel is the caller's concern; this decoder only
//! sees JSON frames.

use serde::Deserialize;

use crate::event::{DecodeError, StreamEvent, TokenUsage};

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: Option<Delta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// Decodes one `data:` frame into at most one event.
///
/// Content deltas surface immediately; usage frames update the accumulator
/// and surface as a `Usage` event so the caller can forward it right before
/// `Done`.
pub fn decode_openai_data(
    data: &str,
    usage: &mut TokenUsage,
) -> Result<Option<StreamEvent>, DecodeError> {
    let chunk: Chunk = serde_json::from_str(data)?;

    if let Some(chunk_usage) = chunk.usage {
        usage.prompt_tokens = chunk_usage.prompt_tokens;
        usage.completion_tokens = chunk_usage.completion_tokens;
        usage.total_tokens = if chunk_usage.total_tokens > 0 {
            chunk_usage.total_tokens
        } else {
            chunk_usage.prompt_tokens + chunk_usage.completion_tokens
        };
        return Ok(Some(usage.into_event()));
    }

    for choice in chunk.choices {
        if choice.finish_reason.is_some() {
            continue;
        }
        if let Some(text) = choice.delta.and_then(|delta| delta.content) {
            if !text.is_empty() {
                return Ok(Some(StreamEvent::content(text)));
            }
        }
    }

    Ok(None)
}
