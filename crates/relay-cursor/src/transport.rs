//! The Cursor chat transport.
//!
//! Dispatch order: a pooled session cookie first; on any failure there, one
//! fallback through a freshly minted `x-is-human` token. The SSE producer
//! relays frames through the Cursor decoder and closes the channel exactly
//! once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use relay_chat::truncate_messages;
use relay_core::ids::random_id;
use relay_core::{map_http_status, CursorSettings, ErrorKind, RelayError};
use relay_provider::{ChatRequest, EventReceiver, ModelInfo, ProviderAdapter};
use relay_stream::{decode_cursor_frame, StreamEvent, TokenUsage};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::antibot::{AntiBotEngine, AntiBotError, SEC_CH_UA};
use crate::model_map::{cursor_model_listing, map_cursor_model};
use crate::pool::{CursorSession, SessionPool};

const SESSION_COOKIE_NAME: &str = "WorkosCursorSessionToken";
const CLOUDFLARE_SENTINELS: &[&str] = &["just a moment", "cf-chl", "attention required"];

/// Cursor web transport exposed to the router as a regular adapter.
pub struct CursorTransport {
    client: reqwest::Client,
    settings: CursorSettings,
    pool: Arc<SessionPool>,
    antibot: AntiBotEngine,
    session_labels: Mutex<HashMap<String, String>>,
}

impl CursorTransport {
    pub fn new(settings: CursorSettings, pool: Arc<SessionPool>) -> Self {
        Self {
            client: reqwest::Client::new(),
            antibot: AntiBotEngine::new(settings.clone()),
            settings,
            pool,
            session_labels: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    async fn send_with_session(
        &self,
        payload: &Value,
        session: &CursorSession,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut cookie = format!("{SESSION_COOKIE_NAME}={}", session.token);
        for (name, value) in &session.extra_cookies {
            cookie.push_str("; ");
            cookie.push_str(name);
            cookie.push('=');
            cookie.push_str(value);
        }
        let user_agent = session
            .user_agent
            .as_deref()
            .unwrap_or(&self.settings.user_agent);

        self.client
            .post(&self.settings.chat_url)
            .header("Cookie", cookie)
            .header("Authorization", format!("Bearer {}", session.token))
            .header("User-Agent", user_agent)
            .header("sec-ch-ua", SEC_CH_UA)
            .header("sec-ch-ua-mobile", "?0")
            .header("sec-ch-ua-platform", "\"Windows\"")
            .header("Origin", "https://cursor.com")
            .header("Referer", "https://cursor.com/")
            .header("Accept", "text/event-stream")
            .json(payload)
            .send()
            .await
    }

    async fn send_with_is_human(
        &self,
        payload: &Value,
        token: &str,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(&self.settings.chat_url)
            .header("x-is-human", token)
            .header("User-Agent", &self.settings.user_agent)
            .header("sec-ch-ua", SEC_CH_UA)
            .header("sec-ch-ua-mobile", "?0")
            .header("sec-ch-ua-platform", "\"Windows\"")
            .header("Origin", "https://cursor.com")
            .header("Referer", "https://cursor.com/")
            .header("Accept", "text/event-stream")
            .json(payload)
            .send()
            .await
    }

    fn remember_session(&self, request: &ChatRequest, email: &str) {
        if let Some(request_id) = &request.request_id {
            self.session_labels
                .lock()
                .expect("session label lock poisoned")
                .insert(request_id.clone(), email.to_string());
        }
    }
}

#[async_trait]
impl ProviderAdapter for CursorTransport {
    fn name(&self) -> &'static str {
        "cursor"
    }

    fn is_available(&self) -> bool {
        self.pool.has_valid_sessions() || self.settings.is_configured()
    }

    fn supported_models(&self) -> Vec<ModelInfo> {
        cursor_model_listing()
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<EventReceiver, RelayError> {
        let mut request = request;
        request.messages =
            truncate_messages(request.messages, self.settings.max_input_length);
        let payload = build_payload(&request);

        // Path one: a pooled session cookie.
        if let Ok(session) = self.pool.get_valid_session() {
            match self.send_with_session(&payload, &session).await {
                Ok(response) if response.status().as_u16() == 200 => {
                    self.pool.mark_success(&session.email);
                    self.remember_session(&request, &session.email);
                    return Ok(spawn_producer(response));
                }
                Ok(response) => {
                    debug!(
                        email = %session.email,
                        status = response.status().as_u16(),
                        "cursor session path rejected, falling back to x-is-human"
                    );
                    self.pool.mark_failed(&session.email);
                }
                Err(error) => {
                    warn!(email = %session.email, %error, "cursor session path failed");
                    self.pool.mark_failed(&session.email);
                }
            }
        }

        // Path two: mint a fresh anti-bot token. This is the only retry.
        let token = self
            .antibot
            .fetch_token()
            .await
            .map_err(|error| antibot_error(error, &request))?;
        let response = self
            .send_with_is_human(&payload, &token)
            .await
            .map_err(|error| {
                RelayError::new(ErrorKind::ProviderError, format!("cursor transport: {error}"))
                    .with_provider("cursor")
                    .with_model(request.model.clone())
            })?;

        let status = response.status().as_u16();
        if status != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(cursor_web_error(status, &body, &request));
        }

        Ok(spawn_producer(response))
    }

    fn take_session_label(&self, request_id: &str) -> Option<String> {
        self.session_labels
            .lock()
            .expect("session label lock poisoned")
            .remove(request_id)
    }
}

fn build_payload(request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            json!({
                "role": message.role.as_str(),
                "content": message.content,
            })
        })
        .collect();
    json!({
        "context": [],
        "model": map_cursor_model(&request.model),
        "id": random_id(16),
        "messages": messages,
        "trigger": "submit-message",
        "tools": request.tools,
    })
}

fn antibot_error(error: AntiBotError, request: &ChatRequest) -> RelayError {
    let mapped = match &error {
        AntiBotError::Upstream { status, body } => {
            RelayError::new(map_http_status(*status, body), error.to_string()).with_status(*status)
        }
        AntiBotError::Fetch(_) | AntiBotError::Script(_) => {
            RelayError::new(ErrorKind::ProviderError, error.to_string())
        }
    };
    mapped
        .with_provider("cursor")
        .with_model(request.model.clone())
}

fn cursor_web_error(status: u16, body: &str, request: &ChatRequest) -> RelayError {
    let lowered = body.to_ascii_lowercase();
    let internal = if CLOUDFLARE_SENTINELS
        .iter()
        .any(|sentinel| lowered.contains(sentinel))
    {
        "Cloudflare 403".to_string()
    } else {
        format!("cursor web error {status}: {body}")
    };
    RelayError::new(map_http_status(status, body), internal)
        .with_status(status)
        .with_provider("cursor")
        .with_model(request.model.clone())
}

fn spawn_producer(response: reqwest::Response) -> EventReceiver {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        run_stream(response, tx).await;
    });
    rx
}

async fn run_stream(response: reqwest::Response, tx: mpsc::UnboundedSender<StreamEvent>) {
    if tx.send(StreamEvent::Start).is_err() {
        return;
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut usage = TokenUsage::default();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                // Receiver gone means the request was cancelled; stay quiet.
                let _ = tx.send(StreamEvent::error(if error.is_timeout() {
                    "the request timed out"
                } else {
                    "AI service temporarily unavailable"
                }));
                warn!(provider = "cursor", %error, "stream read failed");
                return;
            }
        };
        let Ok(fragment) = std::str::from_utf8(chunk.as_ref()) else {
            let _ = tx.send(StreamEvent::error("AI service temporarily unavailable"));
            return;
        };
        buffer.push_str(fragment);

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);
            let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                continue;
            };
            if data == "[DONE]" {
                let _ = tx.send(StreamEvent::Done);
                return;
            }
            let events = match decode_cursor_frame(data, &mut usage) {
                Ok(events) => events,
                Err(error) => {
                    warn!(provider = "cursor", %error, "skipping undecodable frame");
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

    let _ = tx.send(StreamEvent::Done);
}
