//! Request translation and the shared dispatch/collection pipeline behind
//! both compat endpoints.

use relay_chat::{
    parse_tool_call, ChatStore, NewChatMessage, ParsedToolCall, SendMessageOutcome,
    SendMessageRequest,
};
use relay_core::current_unix_timestamp_ms;
use relay_provider::{EventReceiver, MessageRole, ToolChoice, ToolDefinition};
use relay_store::TokenIdentity;
use relay_stream::StreamEvent;
use relay_usage::UsageRecord;
use serde_json::Value;
use tracing::warn;

use crate::auth::enforce_model_restriction;
use crate::state::GatewayState;
use crate::types::GatewayApiError;

/// Flattens OpenAI/Anthropic content (a string or typed parts) to text.
pub(crate) fn flatten_content(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.clone()),
                Value::Object(map) => map
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(""),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// Conversation-shaped view of an inbound message list.
#[derive(Debug, PartialEq)]
pub(crate) struct TranslatedHistory {
    pub system_prompt: Option<String>,
    /// Turns preceding the final user message, in order.
    pub prior: Vec<(MessageRole, String)>,
    pub last_user: String,
}

/// Splits `(role, content)` pairs into system prompt, prior turns, and the
/// final user message the orchestrator dispatches on.
pub(crate) fn split_history(
    messages: &[(String, Value)],
) -> Result<TranslatedHistory, GatewayApiError> {
    let mut system_sections: Vec<String> = Vec::new();
    let mut turns: Vec<(MessageRole, String)> = Vec::new();

    for (role, content) in messages {
        let text = flatten_content(content);
        match role.trim().to_ascii_lowercase().as_str() {
            "system" | "developer" => {
                if !text.trim().is_empty() {
                    system_sections.push(text);
                }
            }
            "user" => turns.push((MessageRole::User, text)),
            "assistant" => turns.push((MessageRole::Assistant, text)),
            "tool" => turns.push((MessageRole::Tool, text)),
            other => {
                return Err(GatewayApiError::bad_request(format!(
                    "unsupported message role '{other}'"
                )))
            }
        }
    }

    let Some((MessageRole::User, last_user)) = turns.pop() else {
        return Err(GatewayApiError::bad_request(
            "the final message must be a user message",
        ));
    };
    if last_user.trim().is_empty() {
        return Err(GatewayApiError::bad_request("empty message content"));
    }

    Ok(TranslatedHistory {
        system_prompt: if system_sections.is_empty() {
            None
        } else {
            Some(system_sections.join("\n\n"))
        },
        prior: turns,
        last_user,
    })
}

/// Sampling parameters forwarded verbatim.
#[derive(Debug, Default, Clone)]
pub(crate) struct GenParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
}

/// Shared endpoint pipeline: restriction check, conversation materialise,
/// history persist, orchestrator dispatch.
pub(crate) async fn dispatch(
    state: &GatewayState,
    identity: &TokenIdentity,
    model: &str,
    history: TranslatedHistory,
    tools: Vec<ToolDefinition>,
    tool_choice: Option<ToolChoice>,
    params: GenParams,
) -> Result<(SendMessageOutcome, i64), GatewayApiError> {
    enforce_model_restriction(identity, model)?;

    let conversation = state
        .store
        .create_conversation(identity.user_id, model, history.system_prompt.as_deref())
        .map_err(|error| {
            tracing::error!(%error, "conversation create failed");
            GatewayApiError::bad_request("invalid request")
        })?;

    for (role, content) in history.prior {
        state
            .store
            .insert_chat_message(NewChatMessage {
                conversation_id: conversation.id,
                role,
                content,
                prompt_tokens: 0,
                completion_tokens: 0,
                cost: 0.0,
            })
            .map_err(|error| {
                tracing::error!(%error, "history persist failed");
                GatewayApiError::bad_request("invalid request")
            })?;
    }

    let mut request = SendMessageRequest::new(conversation.id, identity.user_id, history.last_user);
    request.model = Some(model.to_string());
    request.tools = tools;
    request.tool_choice = tool_choice;
    request.max_tokens = params.max_tokens;
    request.temperature = params.temperature;
    request.top_p = params.top_p;
    request.stop = params.stop;

    let outcome = state.orchestrator.send_message(request).await?;
    Ok((outcome, conversation.id))
}

/// Fully drained stream, ready for response assembly.
#[derive(Debug, Default)]
pub(crate) struct CollectedStream {
    pub text: String,
    pub tool_call: Option<ParsedToolCall>,
    pub usage: Option<(u64, u64, u64)>,
    pub error: Option<String>,
}

/// Drains a response stream to completion.
///
/// With `parse_tools` set, the assembled text is scanned for the in-band
/// tool protocol; a malformed block is a hard error, not silently passed
/// through as prose.
pub(crate) async fn collect_stream(
    events: &mut EventReceiver,
    parse_tools: bool,
) -> CollectedStream {
    let mut collected = CollectedStream::default();

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Start => {}
            StreamEvent::Content { text } => collected.text.push_str(&text),
            StreamEvent::ToolUse { id, name, input } => {
                collected.tool_call = Some(ParsedToolCall {
                    id,
                    name,
                    input,
                    prefix_text: std::mem::take(&mut collected.text),
                });
            }
            StreamEvent::Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
            } => collected.usage = Some((prompt_tokens, completion_tokens, total_tokens)),
            StreamEvent::Done => break,
            StreamEvent::Error { message } => {
                collected.error = Some(message);
                break;
            }
        }
    }

    if parse_tools && collected.error.is_none() && collected.tool_call.is_none() {
        match parse_tool_call(&collected.text) {
            Ok(Some(parsed)) => {
                collected.text = parsed.prefix_text.clone();
                collected.tool_call = Some(parsed);
            }
            Ok(None) => {}
            Err(error) => {
                warn!(%error, "assistant emitted a malformed tool call");
                collected.error = Some("assistant produced a malformed tool call".to_string());
            }
        }
    }

    collected
}

/// Persists the assistant turn and hands the usage record to the tracker.
/// Never blocks or fails the reply.
pub(crate) fn finalize_stream(
    state: &GatewayState,
    identity: &TokenIdentity,
    conversation_id: i64,
    model: &str,
    request_id: &str,
    collected: &CollectedStream,
    started_unix_ms: u64,
) {
    let (prompt_tokens, completion_tokens, total_tokens) = collected.usage.unwrap_or((0, 0, 0));

    if collected.error.is_none() {
        let assistant_text = match &collected.tool_call {
            Some(call) => format!(
                "{}<tool_call><tool_name>{}</tool_name><tool_input>{}</tool_input></tool_call>",
                call.prefix_text, call.name, call.input
            ),
            None => collected.text.clone(),
        };
        if let Err(error) = state.orchestrator.persist_assistant_turn(
            conversation_id,
            model,
            assistant_text,
            prompt_tokens,
            completion_tokens,
        ) {
            tracing::error!(internal = error.internal_message(), "assistant persist failed");
        }
    }

    let cursor_session = state
        .router
        .select(model)
        .ok()
        .and_then(|adapter| adapter.take_session_label(request_id));

    let now = current_unix_timestamp_ms();
    let accepted = state.tracker.track(UsageRecord {
        user_id: identity.user_id,
        username: identity.username.clone(),
        token_id: identity.token_id,
        token_name: identity.token_name.clone(),
        model: model.to_string(),
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cursor_session,
        status_code: if collected.error.is_none() { 200 } else { 502 },
        error_message: collected.error.clone(),
        request_time_unix_ms: started_unix_ms,
        response_time_unix_ms: now,
        duration_ms: now.saturating_sub(started_unix_ms),
    });
    if !accepted && state.tracker.is_enabled() {
        warn!(request_id, "usage record dropped");
    }
}
