//! Decoder for Cursor web-chat SSE frames.
//!
//! The Cursor transport relays `data:` frames verbatim; this decoder turns
//! them into uniform events. Text deltas arrive as bare JSON strings, control
//! frames as small objects. Unknown frames decode to nothing so upstream
//! additions do not break live streams.

use serde_json::Value;

use crate::event::{DecodeError, StreamEvent, TokenUsage};

/// Decodes one relayed Cursor frame.
pub fn decode_cursor_frame(
    data: &str,
    usage: &mut TokenUsage,
) -> Result<Vec<StreamEvent>, DecodeError> {
    let payload: Value = serde_json::from_str(data)?;

    match payload {
        Value::String(text) => {
            if text.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![StreamEvent::content(text)])
            }
        }
        Value::Object(map) => {
            if let Some(message) = map.get("error").and_then(Value::as_str) {
                return Ok(vec![StreamEvent::error(message)]);
            }

            let mut events = Vec::new();
            if let Some(text) = map.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    events.push(StreamEvent::content(text));
                }
            }
            if let Some(frame_usage) = map.get("usage").and_then(Value::as_object) {
                usage.prompt_tokens = frame_usage
                    .get("input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(usage.prompt_tokens);
                usage.completion_tokens = frame_usage
                    .get("output_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(usage.completion_tokens);
                usage.recompute_total();
                events.push(usage.into_event());
            }
            if map.get("done").and_then(Value::as_bool) == Some(true) {
                events.push(StreamEvent::Done);
            }
            Ok(events)
        }
        _ => Ok(Vec::new()),
    }
}
