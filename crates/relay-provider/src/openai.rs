//! OpenAI-compatible streaming adapter.
//!
//! One adapter serves OpenAI, DeepSeek, and OpenRouter; they share the chat
//! completions wire shape and differ only in base URL and listing.

use async_trait::async_trait;
use futures_util::StreamExt;
use relay_core::{ProviderEndpoint, RelayError};
use relay_stream::{decode_openai_data, StreamEvent, TokenUsage};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use crate::adapter::{map_transport_error, map_upstream_status, EventReceiver, ProviderAdapter};
use crate::sse::{data_payload, LineBuffer};
use crate::types::{ChatRequest, MessageRole, ModelInfo};

const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com/v1";
const DEEPSEEK_DEFAULT_BASE: &str = "https://api.deepseek.com/v1";
const OPENROUTER_DEFAULT_BASE: &str = "https://openrouter.ai/api/v1";

/// Streaming adapter for the OpenAI chat-completions wire shape.
pub struct OpenAiCompatAdapter {
    client: reqwest::Client,
    provider: &'static str,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatAdapter {
    pub fn openai(endpoint: &ProviderEndpoint) -> Option<Self> {
        Self::from_endpoint("openai", endpoint, OPENAI_DEFAULT_BASE)
    }

    pub fn deepseek(endpoint: &ProviderEndpoint) -> Option<Self> {
        Self::from_endpoint("deepseek", endpoint, DEEPSEEK_DEFAULT_BASE)
    }

    pub fn openrouter(endpoint: &ProviderEndpoint) -> Option<Self> {
        Self::from_endpoint("openrouter", endpoint, OPENROUTER_DEFAULT_BASE)
    }

    fn from_endpoint(
        provider: &'static str,
        endpoint: &ProviderEndpoint,
        default_base: &str,
    ) -> Option<Self> {
        if !endpoint.is_configured() {
            return None;
        }
        let api_key = endpoint.api_key.clone()?.trim().to_string();
        let base_url = endpoint
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string());
        Some(Self {
            client: reqwest::Client::new(),
            provider,
            api_key,
            base_url,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &'static str {
        self.provider
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn supported_models(&self) -> Vec<ModelInfo> {
        models_from_pricing(self.provider)
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<EventReceiver, RelayError> {
        let body = build_chat_body(&request);
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|error| map_transport_error(self.provider, &request, &error))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_upstream_status(
                self.provider,
                &request,
                status.as_u16(),
                &body_text,
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let provider = self.provider;
        tokio::spawn(async move {
            run_stream(response, tx, provider).await;
        });
        Ok(rx)
    }
}

fn build_chat_body(request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            json!({
                "role": wire_role(message.role),
                "content": message.content,
            })
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(stop) = &request.stop {
        body["stop"] = json!(stop);
    }
    body
}

fn wire_role(role: MessageRole) -> &'static str {
    // Tool results travel as user turns; the in-band tool protocol never
    // produces native tool-role messages on this path.
    match role {
        MessageRole::System => "system",
        MessageRole::User | MessageRole::Tool => "user",
        MessageRole::Assistant => "assistant",
    }
}

async fn run_stream(
    response: reqwest::Response,
    tx: mpsc::UnboundedSender<StreamEvent>,
    provider: &'static str,
) {
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
                warn!(provider, %error, "stream read failed");
                return;
            }
        };
        let Ok(fragment) = std::str::from_utf8(chunk.as_ref()) else {
            let _ = tx.send(StreamEvent::error("AI service temporarily unavailable"));
            warn!(provider, "stream produced invalid UTF-8");
            return;
        };
        lines.push(fragment);

        while let Some(line) = lines.next_line() {
            let Some(data) = data_payload(&line) else {
                continue;
            };
            if data == "[DONE]" {
                let _ = tx.send(StreamEvent::Done);
                return;
            }
            match decode_openai_data(data, &mut usage) {
                Ok(Some(event)) => {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(provider, %error, "skipping undecodable stream chunk");
                }
            }
        }
    }

    // Upstream closed without the [DONE] sentinel; terminate the contract
    // anyway.
    if let Some(line) = lines.take_trailing() {
        if let Some(data) = data_payload(&line) {
            if data != "[DONE]" {
                if let Ok(Some(event)) = decode_openai_data(data, &mut usage) {
                    let _ = tx.send(event);
                }
            }
        }
    }
    let _ = tx.send(StreamEvent::Done);
}

/// Listing rows for one provider, priced from the central table.
pub(crate) fn models_from_pricing(provider: &str) -> Vec<ModelInfo> {
    relay_pricing::PRICING_TABLE
        .iter()
        .filter(|row| row.provider == provider)
        .map(|row| {
            let mut info = ModelInfo::new(row.model, row.provider);
            info.input_price_per_million = Some(row.input_per_million);
            info.output_price_per_million = Some(row.output_per_million);
            info
        })
        .collect()
}
