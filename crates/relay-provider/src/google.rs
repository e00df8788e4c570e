//! Google Gemini streaming adapter.

use async_trait::async_trait;
use futures_util::StreamExt;
use relay_core::{ProviderEndpoint, RelayError};
use relay_stream::{decode_google_chunk, StreamEvent, TokenUsage};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::adapter::{map_transport_error, map_upstream_status, EventReceiver, ProviderAdapter};
use crate::openai::models_from_pricing;
use crate::sse::{data_payload, LineBuffer};
use crate::types::{ChatRequest, MessageRole, ModelInfo};

const GOOGLE_DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Streaming adapter for `models/{model}:streamGenerateContent`.
pub struct GoogleAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GoogleAdapter {
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
                .unwrap_or_else(|| GOOGLE_DEFAULT_BASE.to_string()),
        })
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/models/{model}:streamGenerateContent?alt=sse",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn name(&self) -> &'static str {
        "google"
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn supported_models(&self) -> Vec<ModelInfo> {
        models_from_pricing("google")
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<EventReceiver, RelayError> {
        let body = build_generate_body(&request);
        let response = self
            .client
            .post(self.stream_url(&request.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| map_transport_error("google", &request, &error))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_upstream_status(
                "google",
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

fn build_generate_body(request: &ChatRequest) -> Value {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|message| message.role == MessageRole::System)
        .map(|message| message.content.as_str())
        .collect();
    let contents: Vec<Value> = request
        .messages
        .iter()
        .filter(|message| message.role != MessageRole::System)
        .map(|message| {
            let role = match message.role {
                MessageRole::Assistant => "model",
                _ => "user",
            };
            json!({ "role": role, "parts": [{ "text": message.content }] })
        })
        .collect();

    let mut body = json!({ "contents": contents });
    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        generation_config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation_config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(stop) = &request.stop {
        generation_config.insert("stopSequences".to_string(), json!(stop));
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = Value::Object(generation_config);
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

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                let _ = tx.send(StreamEvent::error(if error.is_timeout() {
                    "the request timed out"
                } else {
                    "AI service temporarily unavailable"
                }));
                warn!(provider = "google", %error, "stream read failed");
                return;
            }
        };
        let Ok(fragment) = std::str::from_utf8(chunk.as_ref()) else {
            let _ = tx.send(StreamEvent::error("AI service temporarily unavailable"));
            return;
        };
        lines.push(fragment);

        while let Some(line) = lines.next_line() {
            let Some(data) = data_payload(&line) else {
                continue;
            };
            let events = match decode_google_chunk(data, &mut usage) {
                Ok(events) => events,
                Err(error) => {
                    warn!(provider = "google", %error, "skipping undecodable chunk");
                    continue;
                }
            };
            for event in events {
                let terminal = event.is_terminal();
                if tx.send(event).is_err() {
                    return;
                }
                if terminal {
                    return;
                }
            }
        }
    }

    // No explicit finish reason observed; close the contract.
    let _ = tx.send(StreamEvent::Done);
}
