//! `POST /v1/chat/completions`, the OpenAI-compatible surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use relay_core::{current_unix_timestamp, current_unix_timestamp_ms, ids::random_id, map_message};
use relay_provider::{ToolChoice, ToolDefinition};
use relay_store::TokenIdentity;
use relay_stream::StreamEvent;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::auth::authenticate;
use crate::state::GatewayState;
use crate::translate::{
    collect_stream, dispatch, finalize_stream, split_history, CollectedStream, GenParams,
};
use crate::types::{GatewayApiError, SseFrame};

const CHUNK_OBJECT: &str = "chat.completion.chunk";
const COMPLETION_OBJECT: &str = "chat.completion";

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChatRequest {
    model: Option<String>,
    #[serde(default)]
    messages: Vec<IncomingMessage>,
    #[serde(default)]
    stream: bool,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    stop: Option<Value>,
    #[serde(default)]
    tools: Vec<OpenAiTool>,
    tool_choice: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: String,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Value,
}

pub(crate) async fn handle_chat_completions(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(request): Json<OpenAiChatRequest>,
) -> Response {
    match chat_completions(state, headers, request).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    }
}

async fn chat_completions(
    state: Arc<GatewayState>,
    headers: HeaderMap,
    request: OpenAiChatRequest,
) -> Result<Response, GatewayApiError> {
    let started_unix_ms = current_unix_timestamp_ms();
    let identity = authenticate(&headers, &state.store)?;

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
    let history = split_history(&pairs)?;

    let tools = translate_tools(&request.tools)?;
    let tool_choice = translate_tool_choice(request.tool_choice.as_ref())?;
    let has_tools = !tools.is_empty();
    let params = GenParams {
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: translate_stop(request.stop.as_ref()),
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

fn translate_tools(tools: &[OpenAiTool]) -> Result<Vec<ToolDefinition>, GatewayApiError> {
    tools
        .iter()
        .map(|tool| {
            if tool.kind != "function" {
                return Err(GatewayApiError::bad_request(format!(
                    "unsupported tool type '{}'",
                    tool.kind
                )));
            }
            Ok(ToolDefinition {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters: tool.function.parameters.clone(),
            })
        })
        .collect()
}

fn translate_tool_choice(choice: Option<&Value>) -> Result<Option<ToolChoice>, GatewayApiError> {
    let Some(choice) = choice else {
        return Ok(None);
    };
    match choice {
        Value::String(keyword) => match keyword.as_str() {
            "auto" => Ok(Some(ToolChoice::Auto)),
            "none" => Ok(Some(ToolChoice::None)),
            "required" => Ok(Some(ToolChoice::Required)),
            other => Err(GatewayApiError::bad_request(format!(
                "unsupported tool_choice '{other}'"
            ))),
        },
        Value::Object(map) => {
            let name = map
                .get("function")
                .and_then(|function| function.get("name"))
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayApiError::bad_request("tool_choice missing function name"))?;
            Ok(Some(ToolChoice::Tool {
                name: name.to_string(),
            }))
        }
        _ => Err(GatewayApiError::bad_request("unsupported tool_choice")),
    }
}

fn translate_stop(stop: Option<&Value>) -> Option<Vec<String>> {
    match stop {
        Some(Value::String(single)) => Some(vec![single.clone()]),
        Some(Value::Array(values)) => Some(
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", random_id(24))
}

fn base_chunk(id: &str, created: u64, model: &str) -> Value {
    json!({
        "id": id,
        "object": CHUNK_OBJECT,
        "created": created,
        "model": model,
    })
}

fn tool_calls_json(call: &relay_chat::ParsedToolCall) -> Value {
    json!([{
        "id": call.id,
        "type": "function",
        "function": {
            "name": call.name,
            "arguments": call.input.to_string(),
        }
    }])
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

    let (prompt_tokens, completion_tokens, total_tokens) = collected.usage.unwrap_or((0, 0, 0));
    let mut message = json!({ "role": "assistant", "content": collected.text });
    let mut finish_reason = "stop";
    if let Some(call) = &collected.tool_call {
        message["tool_calls"] = tool_calls_json(call);
        if collected.text.is_empty() {
            message["content"] = Value::Null;
        }
        finish_reason = "tool_calls";
    }

    Ok(Json(json!({
        "id": completion_id(),
        "object": COMPLETION_OBJECT,
        "created": current_unix_timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": total_tokens,
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
    let id = completion_id();
    let created = current_unix_timestamp();

    tokio::spawn(async move {
        if has_tools {
            // Tool responses cannot be scanned until the text is complete;
            // buffer and emit as one delta.
            let collected = collect_stream(&mut events, true).await;
            emit_buffered(&tx, &id, created, &model, &collected);
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
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Start => {
                    let mut chunk = base_chunk(&id, created, &model);
                    chunk["choices"] = json!([{
                        "index": 0,
                        "delta": { "role": "assistant", "content": "" },
                        "finish_reason": Value::Null,
                    }]);
                    if tx.send(SseFrame::Data(chunk)).is_err() {
                        return;
                    }
                }
                StreamEvent::Content { text } => {
                    collected.text.push_str(&text);
                    let mut chunk = base_chunk(&id, created, &model);
                    chunk["choices"] = json!([{
                        "index": 0,
                        "delta": { "content": text },
                        "finish_reason": Value::Null,
                    }]);
                    if tx.send(SseFrame::Data(chunk)).is_err() {
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
                    let mut finish = base_chunk(&id, created, &model);
                    finish["choices"] = json!([{
                        "index": 0,
                        "delta": {},
                        "finish_reason": "stop",
                    }]);
                    let _ = tx.send(SseFrame::Data(finish));
                    if let Some((prompt_tokens, completion_tokens, total_tokens)) = collected.usage
                    {
                        let mut usage_chunk = base_chunk(&id, created, &model);
                        usage_chunk["choices"] = json!([]);
                        usage_chunk["usage"] = json!({
                            "prompt_tokens": prompt_tokens,
                            "completion_tokens": completion_tokens,
                            "total_tokens": total_tokens,
                        });
                        let _ = tx.send(SseFrame::Data(usage_chunk));
                    }
                    let _ = tx.send(SseFrame::Done);
                    break;
                }
                StreamEvent::Error { message } => {
                    collected.error = Some(message.clone());
                    let _ = tx.send(SseFrame::Data(json!({
                        "error": { "message": message, "type": "server_error" }
                    })));
                    let _ = tx.send(SseFrame::Done);
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

fn emit_buffered(
    tx: &mpsc::UnboundedSender<SseFrame>,
    id: &str,
    created: u64,
    model: &str,
    collected: &CollectedStream,
) {
    if let Some(message) = &collected.error {
        let _ = tx.send(SseFrame::Data(json!({
            "error": { "message": message, "type": "server_error" }
        })));
        let _ = tx.send(SseFrame::Done);
        return;
    }

    let mut delta = json!({ "role": "assistant", "content": collected.text });
    let mut finish_reason = "stop";
    if let Some(call) = &collected.tool_call {
        delta["tool_calls"] = tool_calls_json(call);
        finish_reason = "tool_calls";
    }

    let mut content_chunk = base_chunk(id, created, model);
    content_chunk["choices"] = json!([{
        "index": 0,
        "delta": delta,
        "finish_reason": Value::Null,
    }]);
    let _ = tx.send(SseFrame::Data(content_chunk));

    let mut finish = base_chunk(id, created, model);
    finish["choices"] = json!([{
        "index": 0,
        "delta": {},
        "finish_reason": finish_reason,
    }]);
    let _ = tx.send(SseFrame::Data(finish));

    if let Some((prompt_tokens, completion_tokens, total_tokens)) = collected.usage {
        let mut usage_chunk = base_chunk(id, created, model);
        usage_chunk["choices"] = json!([]);
        usage_chunk["usage"] = json!({
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": total_tokens,
        });
        let _ = tx.send(SseFrame::Data(usage_chunk));
    }
    let _ = tx.send(SseFrame::Done);
}
