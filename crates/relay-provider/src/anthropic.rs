//! Anthropic messages streaming adapter.

use async_trait::async_trait;
use futures_util::StreamExt;
use relay_core::{ProviderEndpoint, RelayError};
use relay_stream::{decode_anthropic_event, StreamEvent, TokenUsage};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::adapter::{map_transport_error, map_upstream_status, EventReceiver, ProviderAdapter};
use crate::openai::models_from_pricing;
use crate::sse::{data_payload, event_name, LineBuffer};
use crate::types::{ChatRequest, MessageRole, ModelInfo};

const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
/// API version header value pinned for wire stability.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Streaming adapter for the Anthropic messages API.
pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn from_endpoint(endpoint: &ProviderEndpoint) -> Option<Self> {
        if !endpoint.is_configured() {
            return None;
        }
        Some(Self {
            client: reqwest::Client::new(),
            api_key: endpoint.api_key.clone()?.trim().to_string(),
            base_url: endpoint
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE.to_string()),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn supported_models(&self) -> Vec<ModelInfo> {
        models_from_pricing("anthropic")
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<EventReceiver, RelayError> {
        let body = build_messages_body(&request);
        let response = self
            .client
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|error| map_transport_error("anthropic", &request, &error))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_upstream_status(
                "anthropic",
                &request,
                status.as_u16(),
                &body_text,
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            run_stream(response, tx).await;
        });
        Ok(rx)
    }
}

fn build_messages_body(request: &ChatRequest) -> Value {
    // System turns move to the top-level field; Anthropic rejects them
    // in-line.
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .map(|message| message.content.as_str())
        .collect();
    let messages: Vec<Value> = request
        .messages
        .iter()
        .filter(|message| message.role != MessageRole::System)
        .map(|message| {
            let role = match message.role {
                MessageRole::Assistant => "assistant",
                _ => "user",
            };
            json!({ "role": role, "content": message.content })
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
        "stream": true,
    });
    if !system.is_empty() {
        body["system"] = json!(system.join("\n\n"));
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(stop) = &request.stop {
        body["stop_sequences"] = json!(stop);
    }
    body
}

async fn run_stream(response: reqwest::Response, tx: mpsc::UnboundedSender<StreamEvent>) {
    if tx.send(StreamEvent::Start).is_err() {
        return;
    }

    let mut stream = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut usage = TokenUsage::default();
    let mut current_event: Option<String> = None;
    let mut current_data = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                let _ = tx.send(StreamEvent::error(if error.is_timeout() {
                    "the request timed out"
                } else {
                    "AI service temporarily unavailable"
                }));
                warn!(provider = "anthropic", %error, "stream read failed");
                return;
            }
        };
        let Ok(fragment) = std::str::from_utf8(chunk.as_ref()) else {
            let _ = tx.send(StreamEvent::error("AI service temporarily unavailable"));
            return;
        };
        lines.push(fragment);

        while let Some(line) = lines.next_line() {
            if line.is_empty() {
                // Frame boundary: dispatch the buffered event.
                let events = match decode_anthropic_event(
                    current_event.take().as_deref(),
                    current_data.trim(),
                    &mut usage,
                ) {
                    Ok(events) => events,
                    Err(error) => {
                        warn!(provider = "anthropic", %error, "skipping undecodable frame");
                        current_data.clear();
                        continue;
                    }
                };
                current_data.clear();
                for event in events {
                    let terminal = event.is_terminal();
                    if tx.send(event).is_err() {
                        return;
                    }
                    if terminal {
                        return;
                    }
                }
                continue;
            }

            if let Some(name) = event_name(&line) {
                current_event = Some(name.to_string());
                continue;
            }
            if let Some(data) = data_payload(&line) {
                if !current_data.is_empty() {
                    current_data.push('\n');
                }
                current_data.push_str(data);
            }
        }
    }

    // Upstream closed without message_stop; honor the stream contract.
    let _ = tx.send(StreamEvent::Done);
}
