//! `POST /v1/messages`, the Anthropic-compatible surface.
//!
//! Tool-use responses are assembled from the in-band `<tool_call>` protocol
//! and surfaced as native `tool_use` content blocks.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use relay_core::{current_unix_timestamp_ms, ids::random_id, map_message};
use relay_provider::{ToolChoice, ToolDefinition};
use relay_store::TokenIdentity;
use relay_stream::StreamEvent;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::auth::{api_key_or_bearer, authenticate};
use crate::state::GatewayState;
use crate::translate::{
    collect_stream, dispatch, finalize_stream, flatten_content, split_history, CollectedStream,
    GenParams,
};
use crate::types::{GatewayApiError, SseFrame};

#[derive(Debug, Deserialize)]
pub(crate) struct AnthropicMessagesRequest {
    model: Option<String>,
    max_tokens: Option<u32>,
    #[serde(default)]
    messages: Vec<IncomingMessage>,
    system: Option<Value>,
    #[serde(default)]
    stream: bool,
    temperature: Option<f32>,
    top_p: Option<f32>,
    stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    tools: Vec<AnthropicTool>,
    tool_choice: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: String,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_schema: Value,
}

pub(crate) async fn handle_messages(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<AnthropicMessagesRequest>,
) -> Response {
    match messages(state, headers, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn messages(
    state: Arc<GatewayState>,
    headers: HeaderMap,
    request: AnthropicMessagesRequest,
) -> Result<Response, GatewayApiError> {
    let started_unix_ms = current_unix_timestamp_ms();
    let effective_headers = api_key_or_bearer(&headers);
    let identity = authenticate(&effective_headers, &state.store)?;

    let model = request
        .model
        .clone()
        .filter(|model| !model.trim().is_empty())
        .ok_or_else(|| GatewayApiError::bad_request("model is required"))?;

    let pairs: Vec<(String, Value)> = request
        .messages
        .iter()
        .map(|message| (message.role.clone(), message.content.clone()))
        .collect();
    let mut history = split_history(&pairs)?;
    if let Some(system) = &request.system {
        let text = flatten_content(system);
        if !text.trim().is_empty() {
            history.system_prompt = Some(match history.system_prompt.take() {
                Some(existing) => format!("{text}\n\n{existing}"),
                None => text,
            });
        }
    }

    let tools: Vec<ToolDefinition> = request
        .tools
        .iter()
        .map(|tool| ToolDefinition {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        })
        .collect();
    let tool_choice = translate_tool_choice(request.tool_choice.as_ref())?;
    let has_tools = !tools.is_empty();
    let params = GenParams {
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
    };

    let (outcome, conversation_id) =
        dispatch(&state, &identity, &model, history, tools, tool_choice, params).await?;

    if request.stream {
        Ok(stream_response(
            state,
            identity,
            outcome.events,
            conversation_id,
            model,
            outcome.request_id,
            has_tools,
            started_unix_ms,
        ))
    } else {
        aggregate_response(
            state,
            identity,
            outcome.events,
            conversation_id,
            model,
            outcome.request_id,
            has_tools,
            started_unix_ms,
        )
        .await
    }
}

fn translate_tool_choice(choice: Option<&Value>) -> Result<Option<ToolChoice>, GatewayApiError> {
    let Some(choice) = choice else {
        return Ok(None);
    };
    let kind = choice
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayApiError::bad_request("tool_choice requires a type"))?;
    match kind {
        "auto" => Ok(Some(ToolChoice::Auto)),
        "none" => Ok(Some(ToolChoice::None)),
        "any" => Ok(Some(ToolChoice::Any)),
        "tool" => {
            let name = choice
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayApiError::bad_request("tool_choice missing tool name"))?;
            Ok(Some(ToolChoice::Tool {
                name: name.to_string(),
            }))
        }
        other => Err(GatewayApiError::bad_request(format!(
            "unsupported tool_choice type '{other}'"
        ))),
    }
}

fn message_id() -> String {
    format!("msg_{}", random_id(24))
}

fn content_blocks(collected: &CollectedStream) -> (Vec<Value>, &'static str) {
    let mut blocks = Vec::new();
    if !collected.text.is_empty() {
        blocks.push(json!({ "type": "text", "text": collected.text }));
    }
    let mut stop_reason = "end_turn";
    if let Some(call) = &collected.tool_call {
        if !call.prefix_text.is_empty() && collected.text.is_empty() {
            blocks.insert(0, json!({ "type": "text", "text": call.prefix_text }));
        }
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.input,
        }));
        stop_reason = "tool_use";
    }
    (blocks, stop_reason)
}

#[allow(clippy::too_many_arguments)]
async fn aggregate_response(
    state: Arc<GatewayState>,
    identity: TokenIdentity,
    mut events: relay_provider::EventReceiver,
    conversation_id: i64,
    model: String,
    request_id: String,
    has_tools: bool,
    started_unix_ms: u64,
) -> Result<Response, GatewayApiError> {
    let collected = collect_stream(&mut events, has_tools).await;
    finalize_stream(
        &state,
        &identity,
        conversation_id,
        &model,
        &request_id,
        &collected,
        started_unix_ms,
    );

    if let Some(message) = &collected.error {
        return Err(GatewayApiError::from(relay_core::RelayError::new(
            map_message(message),
            message.clone(),
        )));
    }

    let (prompt_tokens, completion_tokens, _) = collected.usage.unwrap_or((0, 0, 0));
    let (blocks, stop_reason) = content_blocks(&collected);
    Ok(Json(json!({
        "id": message_id(),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": blocks,
        "stop_reason": stop_reason,
        "stop_sequence": Value::Null,
        "usage": {
            "input_tokens": prompt_tokens,
            "output_tokens": completion_tokens,
        }
    }))
    .into_response())
}

#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: Arc<GatewayState>,
    identity: TokenIdentity,
    mut events: relay_provider::EventReceiver,
    conversation_id: i64,
    model: String,
    request_id: String,
    has_tools: bool,
    started_unix_ms: u64,
) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<SseFrame>();
    let id = message_id();

    tokio::spawn(async move {
        if has_tools {
            let collected = collect_stream(&mut events, true).await;
            emit_buffered(&tx, &id, &model, &collected);
            finalize_stream(
                &state,
                &identity,
                conversation_id,
                &model,
                &request_id,
                &collected,
                started_unix_ms,
            );
            return;
        }

        let mut collected = CollectedStream::default();
        let mut block_open = false;
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Start => {
                    if send_named(&tx, "message_start", message_start_payload(&id, &model))
                        .is_err()
                    {
                        return;
                    }
                }
                StreamEvent::Content { text } => {
                    if !block_open {
                        block_open = true;
                        if send_named(
                            &tx,
                            "content_block_start",
                            json!({
                                "type": "content_block_start",
                                "index": 0,
                                "content_block": { "type": "text", "text": "" }
                            }),
                        )
                        .is_err()
                        {
                            return;
                        }
                    }
                    collected.text.push_str(&text);
                    if send_named(
                        &tx,
                        "content_block_delta",
                        json!({
                            "type": "content_block_delta",
                            "index": 0,
                            "delta": { "type": "text_delta", "text": text }
                        }),
                    )
                    .is_err()
                    {
                        return;
                    }
                }
                StreamEvent::ToolUse { .. } => {}
                StreamEvent::Usage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens,
                } => {
                    collected.usage = Some((prompt_tokens, completion_tokens, total_tokens));
                }
                StreamEvent::Done => {
                    if block_open {
                        let _ = send_named(
                            &tx,
                            "content_block_stop",
                            json!({ "type": "content_block_stop", "index": 0 }),
                        );
                    }
                    let output_tokens = collected.usage.map(|(_, out, _)| out).unwrap_or(0);
                    let _ = send_named(
                        &tx,
                        "message_delta",
                        json!({
                            "type": "message_delta",
                            "delta": { "stop_reason": "end_turn", "stop_sequence": Value::Null },
                            "usage": { "output_tokens": output_tokens }
                        }),
                    );
                    let _ = send_named(&tx, "message_stop", json!({ "type": "message_stop" }));
                    break;
                }
                StreamEvent::Error { message } => {
                    collected.error = Some(message.clone());
                    let _ = send_named(
                        &tx,
                        "error",
                        json!({
                            "type": "error",
                            "error": { "type": "api_error", "message": message }
                        }),
                    );
                    break;
                }
            }
        }

        finalize_stream(
            &state,
            &identity,
            conversation_id,
            &model,
            &request_id,
            &collected,
            started_unix_ms,
        );
    });

    let stream =
        UnboundedReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame.into_event()));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn message_start_payload(id: &str, model: &str) -> Value {
    json!({
        "type": "message_start",
        "message": {
            "id": id,
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [],
            "stop_reason": Value::Null,
            "usage": { "input_tokens": 0, "output_tokens": 0 }
        }
    })
}

fn send_named(
    tx: &mpsc::UnboundedSender<SseFrame>,
    event: &'static str,
    payload: Value,
) -> Result<(), ()> {
    tx.send(SseFrame::Event { event, payload }).map_err(|_| ())
}

/// Emits a complete named-event sequence from a buffered response.
fn emit_buffered(
    tx: &mpsc::UnboundedSender<SseFrame>,
    id: &str,
    model: &str,
    collected: &CollectedStream,
) {
    if let Some(message) = &collected.error {
        let _ = send_named(
            tx,
            "error",
            json!({
                "type": "error",
                "error": { "type": "api_error", "message": message }
            }),
        );
        return;
    }

    let _ = send_named(tx, "message_start", message_start_payload(id, model));
    let (blocks, stop_reason) = content_blocks(collected);
    for (index, block) in blocks.iter().enumerate() {
        let is_tool = block.get("type").and_then(Value::as_str) == Some("tool_use");
        let start_block = if is_tool {
            json!({
                "type": "tool_use",
                "id": block["id"],
                "name": block["name"],
                "input": {}
            })
        } else {
            json!({ "type": "text", "text": "" })
        };
        let _ = send_named(
            tx,
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": start_block
            }),
        );
        let delta = if is_tool {
            json!({ "type": "input_json_delta", "partial_json": block["input"].to_string() })
        } else {
            json!({ "type": "text_delta", "text": block["text"] })
        };
        let _ = send_named(
            tx,
            "content_block_delta",
            json!({ "type": "content_block_delta", "index": index, "delta": delta }),
        );
        let _ = send_named(
            tx,
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": index }),
        );
    }
    let output_tokens = collected.usage.map(|(_, out, _)| out).unwrap_or(0);
    let _ = send_named(
        tx,
        "message_delta",
        json!({
            "type": "message_delta",
            "delta": { "stop_reason": stop_reason, "stop_sequence": Value::Null },
            "usage": { "output_tokens": output_tokens }
        }),
    );
    let _ = send_named(tx, "message_stop", json!({ "type": "message_stop" }));
}
