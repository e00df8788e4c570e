//! Decoder for Google `streamGenerateContent` chunks.

use serde::Deserialize;

use crate::event::{DecodeError, StreamEvent, TokenUsage};

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u64,
}

/// Decodes one JSON chunk into its ordered events.
///
/// Text parts concatenate into one `Content` per chunk; `usageMetadata`
/// updates the accumulator and surfaces as `Usage`; a finish reason appends
/// `Done` last.
pub fn decode_google_chunk(
    data: &str,
    usage: &mut TokenUsage,
) -> Result<Vec<StreamEvent>, DecodeError> {
    let chunk: Chunk = serde_json::from_str(data)?;
    let mut events = Vec::new();

    let mut text = String::new();
    let mut finished = false;
    for candidate in &chunk.candidates {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(piece) = &part.text {
                    text.push_str(piece);
                }
            }
        }
        if candidate.finish_reason.is_some() {
            finished = true;
        }
    }
    if !text.is_empty() {
        events.push(StreamEvent::content(text));
    }

    if let Some(metadata) = chunk.usage_metadata {
        usage.prompt_tokens = metadata.prompt_token_count;
        usage.completion_tokens = metadata.candidates_token_count;
        usage.total_tokens = if metadata.total_token_count > 0 {
            metadata.total_token_count
        } else {
            metadata.prompt_token_count + metadata.candidates_token_count
        };
        events.push(usage.into_event());
    }

    if finished {
        events.push(StreamEvent::Done);
    }

    Ok(events)
}
