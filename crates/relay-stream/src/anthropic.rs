//! Decoder for Anthropic named SSE events.
//!
//! Input tokens arrive on `message_start`, output tokens on `message_delta`;
//! the accumulator merges the two so the caller can emit a single `Usage`
//! event ahead of `Done`.

use serde_json::Value;

use crate::event::{DecodeError, StreamEvent, TokenUsage};

/// Decodes one named event + data payload into zero or more events.
///
/// `message_stop` yields `[Usage?, Done]`; `error` payloads yield a terminal
/// `Error`. Events the gateway does not surface (pings, block starts for
/// plain text) decode to nothing.
pub fn decode_anthropic_event(
    event_name: Option<&str>,
    data: &str,
    usage: &mut TokenUsage,
) -> Result<Vec<StreamEvent>, DecodeError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let payload: Value = serde_json::from_str(data)?;
    let payload_type = payload
        .get("type")
        .and_then(Value::as_str)
        .or(event_name)
        .unwrap_or_default();

    match payload_type {
        "error" => {
            let message = payload
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("anthropic stream returned an error event");
            Ok(vec![StreamEvent::error(message)])
        }
        "message_start" => {
            if let Some(input_tokens) = payload
                .get("message")
                .and_then(|message| message.get("usage"))
                .and_then(|usage| usage.get("input_tokens"))
                .and_then(Value::as_u64)
            {
                usage.prompt_tokens = input_tokens;
                usage.recompute_total();
            }
            Ok(Vec::new())
        }
        "content_block_delta" => {
            let delta = payload.get("delta").cloned().unwrap_or_default();
            match delta.get("type").and_then(Value::as_str).unwrap_or_default() {
                "text_delta" => {
                    let text = delta
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if text.is_empty() {
                        Ok(Vec::new())
                    } else {
                        Ok(vec![StreamEvent::content(text)])
                    }
                }
                _ => Ok(Vec::new()),
            }
        }
        "message_delta" => {
            if let Some(output_tokens) = payload
                .get("usage")
                .and_then(|usage| usage.get("output_tokens"))
                .and_then(Value::as_u64)
            {
                usage.completion_tokens = output_tokens;
                usage.recompute_total();
            }
            Ok(Vec::new())
        }
        "message_stop" => {
            let mut events = Vec::with_capacity(2);
            if !usage.is_empty() {
                events.push(usage.into_event());
            }
            events.push(StreamEvent::Done);
            Ok(events)
        }
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(frames: &[(Option<&str>, &str)]) -> (Vec<StreamEvent>, TokenUsage) {
        let mut usage = TokenUsage::default();
        let mut events = Vec::new();
        for (event_name, data) in frames {
            events.extend(decode_anthropic_event(*event_name, data, &mut usage).expect("decode"));
        }
        (events, usage)
    }

    #[test]
    fn functional_usage_merges_start_and_delta_tokens() {
        let (events, usage) = run(&[
            (
                Some("message_start"),
                r#"{"type":"message_start","message":{"usage":{"input_tokens":12}}}"#,
            ),
            (
                Some("content_block_delta"),
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hey"}}"#,
            ),
            (
                Some("message_delta"),
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":3}}"#,
            ),
            (Some("message_stop"), r#"{"type":"message_stop"}"#),
        ]);

        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(
            events,
            vec![
                StreamEvent::content("hey"),
                StreamEvent::Usage {
                    prompt_tokens: 12,
                    completion_tokens: 3,
                    total_tokens: 15
                },
                StreamEvent::Done,
            ]
        );
    }

    #[test]
    fn unit_stop_without_usage_still_terminates_with_done() {
        let (events, _) = run(&[(Some("message_stop"), r#"{"type":"message_stop"}"#)]);
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn unit_error_event_is_terminal() {
        let (events, _) = run(&[(
            Some("error"),
            r#"{"type":"error","error":{"type":"overloaded_error","message":"overloaded"}}"#,
        )]);
        assert_eq!(events, vec![StreamEvent::error("overloaded")]);
    }

    #[test]
    fn ping_and_block_start_decode_to_nothing() {
        let (events, _) = run(&[
            (Some("ping"), r#"{"type":"ping"}"#),
            (
                Some("content_block_start"),
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            ),
        ]);
        assert!(events.is_empty());
    }
}
