//! End-to-end gateway scenarios against mocked upstream providers.

use std::sync::Arc;

use httpmock::prelude::*;
use relay_auth::{EmailCodeIssuer, TurnstileVerifier};
use relay_chat::{BalanceStatus, ChatOrchestrator, ChatStore};
use relay_core::{GatewayConfig, ProviderEndpoint};
use relay_gateway::{serve, GatewayState};
use relay_provider::{MessageRole, ProviderRouter};
use relay_store::Store;
use relay_usage::{UsageStore, UsageTracker};
use serde_json::{json, Value};

struct TestGateway {
    base_url: String,
    store: Arc<Store>,
    state: Arc<GatewayState>,
    tracker: Arc<UsageTracker>,
    worker: tokio::task::JoinHandle<()>,
    token: String,
    user_id: i64,
}

impl TestGateway {
    async fn start(config: GatewayConfig) -> Self {
        let turnstile = TurnstileVerifier::new(&config.turnstile);
        Self::start_with(config, turnstile).await
    }

    async fn start_with(config: GatewayConfig, turnstile: TurnstileVerifier) -> Self {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let router = Arc::new(ProviderRouter::from_settings(&config.providers, None));
        let (tracker, usage_worker) = UsageTracker::build(
            config.tracker.clone(),
            Arc::clone(&store) as Arc<dyn UsageStore>,
        );
        let tracker = Arc::new(tracker);
        let worker = tokio::spawn(usage_worker.run());

        let orchestrator = ChatOrchestrator::new(
            Arc::clone(&store) as Arc<dyn ChatStore>,
            Arc::clone(&router),
            None,
            config.cursor.max_input_length,
        );
        let state = Arc::new(GatewayState {
            turnstile,
            email_codes: EmailCodeIssuer::default(),
            config,
            store: Arc::clone(&store),
            router,
            orchestrator,
            tracker: Arc::clone(&tracker),
            cursor_pool: None,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let local_addr = listener.local_addr().expect("addr");
        tokio::spawn(serve(listener, Arc::clone(&state)));

        let user = store.create_user("tester", None).expect("user");
        store
            .set_balance(user.id, 1.0, BalanceStatus::Active)
            .expect("balance");
        let token = store.create_token(user.id, "suite", None).expect("token");

        Self {
            base_url: format!("http://{local_addr}"),
            store,
            state,
            tracker,
            worker,
            token: token.token,
            user_id: user.id,
        }
    }

    async fn flush_usage(self) -> Arc<Store> {
        self.tracker.stop();
        let _ = self.worker.await;
        drop(self.state);
        self.store
    }
}

fn openai_config(base_url: String) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.providers.openai = ProviderEndpoint {
        api_key: Some("sk-upstream".to_string()),
        base_url: Some(base_url),
    };
    config.tracker.batch_size = 1;
    config.tracker.flush_interval_ms = 20;
    config
}

fn openai_sse_fixture() -> &'static str {
    concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"p\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"o\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"n\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"g\"},\"finish_reason\":null}]}\n\n",
        "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":4,\"total_tokens\":9}}\n\n",
        "data: [DONE]\n\n",
    )
}

#[tokio::test]
async fn openai_streamed_hello_persists_the_costed_assistant_turn() {
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(openai_sse_fixture());
        })
        .await;

    let gateway = TestGateway::start(openai_config(upstream.base_url())).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .bearer_auth(&gateway.token)
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "ping" }],
            "stream": true
        }))
        .send()
        .await
        .expect("response");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.expect("body");

    // Four content deltas, a usage chunk, and the sentinel.
    assert!(body.contains("\"content\":\"p\""), "body: {body}");
    assert!(body.contains("\"content\":\"g\""));
    assert!(body.contains("\"prompt_tokens\":5"));
    assert!(body.contains("\"completion_tokens\":4"));
    assert!(body.ends_with("data: [DONE]\n\n"));

    // The assistant turn is persisted with text and central-table cost.
    let store = gateway.flush_usage().await;
    let turns = store.list_conversation_messages(1).expect("turns");
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, MessageRole::User);
    assert_eq!(turns[0].content, "ping");
    assert_eq!(turns[1].role, MessageRole::Assistant);
    assert_eq!(turns[1].content, "pong");
    assert_eq!(turns[1].prompt_tokens, 5);
    assert_eq!(turns[1].completion_tokens, 4);
    assert!((turns[1].cost - 5.25e-5).abs() < 1e-12);

    // Exactly one usage record reached the store.
    assert_eq!(store.usage_record_count().expect("count"), 1);
}

#[tokio::test]
async fn non_streaming_request_aggregates_the_final_body() {
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(openai_sse_fixture());
        })
        .await;

    let gateway = TestGateway::start(openai_config(upstream.base_url())).await;
    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .bearer_auth(&gateway.token)
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "ping" }],
            "stream": false
        }))
        .send()
        .await
        .expect("response")
        .json()
        .await
        .expect("json");

    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
    assert_eq!(body["usage"]["total_tokens"], 9);
}

#[tokio::test]
async fn balance_block_rejects_before_any_side_effect() {
    let upstream = MockServer::start_async().await;
    let upstream_mock = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).body("");
        })
        .await;

    let gateway = TestGateway::start(openai_config(upstream.base_url())).await;
    gateway
        .store
        .set_balance(gateway.user_id, 0.0009, BalanceStatus::Active)
        .expect("balance");

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .bearer_auth(&gateway.token)
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "ping" }],
            "stream": true
        }))
        .send()
        .await
        .expect("response");

    assert_eq!(response.status().as_u16(), 402);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"]["code"], "INSUFFICIENT_BALANCE");

    // No user turn was inserted and the upstream was never called.
    let turns = gateway.store.list_conversation_messages(1).expect("turns");
    assert!(turns.is_empty());
    upstream_mock.assert_calls_async(0).await;
}

#[tokio::test]
async fn unknown_bearer_token_is_unauthorized() {
    let upstream = MockServer::start_async().await;
    let gateway = TestGateway::start(openai_config(upstream.base_url())).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/chat/completions", gateway.base_url))
        .bearer_auth("rk-forged")
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "ping" }]
        }))
        .send()
        .await
        .expect("response");
    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn models_listing_includes_configured_and_free_rows() {
    let upstream = MockServer::start_async().await;
    let gateway = TestGateway::start(openai_config(upstream.base_url())).await;
    let client = reqwest::Client::new();
    let body: Value = client
        .get(format!("{}/v1/models", gateway.base_url))
        .bearer_auth(&gateway.token)
        .send()
        .await
        .expect("response")
        .json()
        .await
        .expect("json");

    let data = body["data"].as_array().expect("data");
    assert!(data.iter().any(|row| row["id"] == "gpt-4o"));
    assert!(data.iter().any(|row| row["free"] == true));
}

#[tokio::test]
async fn anthropic_compat_returns_native_message_shape() {
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    "event: message_start\n",
                    "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":7}}}\n\n",
                    "event: content_block_delta\n",
                    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"salut\"}}\n\n",
                    "event: message_delta\n",
                    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
                    "event: message_stop\n",
                    "data: {\"type\":\"message_stop\"}\n\n",
                ));
        })
        .await;

    let mut config = GatewayConfig::default();
    config.providers.anthropic = ProviderEndpoint {
        api_key: Some("sk-ant-upstream".to_string()),
        base_url: Some(upstream.base_url()),
    };
    let gateway = TestGateway::start(config).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{}/v1/messages", gateway.base_url))
        .header("x-api-key", &gateway.token)
        .json(&json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 64,
            "messages": [{ "role": "user", "content": "bonjour" }]
        }))
        .send()
        .await
        .expect("response")
        .json()
        .await
        .expect("json");

    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "salut");
    assert_eq!(body["usage"]["input_tokens"], 7);
    assert_eq!(body["usage"]["output_tokens"], 2);
    assert_eq!(body["stop_reason"], "end_turn");
}

#[tokio::test]
async fn email_code_flow_is_turnstile_gated_and_single_use() {
    let upstream = MockServer::start_async().await;
    let turnstile_upstream = MockServer::start_async().await;
    turnstile_upstream
        .mock_async(|when, then| {
            when.method(POST).path("/siteverify");
            then.status(200).json_body(json!({ "success": true }));
        })
        .await;

    let mut config = openai_config(upstream.base_url());
    config.turnstile.secret_key = Some("ts-secret".to_string());
    let verifier = TurnstileVerifier::new(&config.turnstile)
        .with_verify_url(format!("{}/siteverify", turnstile_upstream.base_url()));
    let gateway = TestGateway::start_with(config, verifier).await;

    // Issuance is gated by a passing Turnstile challenge.
    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{}/v1/auth/email-code", gateway.base_url))
        .json(&json!({ "email": "dev@relay.example", "turnstile_token": "tok" }))
        .send()
        .await
        .expect("response")
        .json()
        .await
        .expect("json");
    assert_eq!(body["sent"], true);

    // The plaintext code goes to the mailer collaborator; drive the issuer
    // directly to exercise the verify endpoint.
    let code = gateway.state.email_codes.issue("dev@relay.example");
    let body: Value = client
        .post(format!("{}/v1/auth/email-verify", gateway.base_url))
        .json(&json!({ "email": "dev@relay.example", "code": code }))
        .send()
        .await
        .expect("response")
        .json()
        .await
        .expect("json");
    assert_eq!(body["verified"], true);

    // Replay is refused.
    let body: Value = client
        .post(format!("{}/v1/auth/email-verify", gateway.base_url))
        .json(&json!({ "email": "dev@relay.example", "code": code }))
        .send()
        .await
        .expect("response")
        .json()
        .await
        .expect("json");
    assert_eq!(body["verified"], false);
}

#[tokio::test]
async fn email_code_without_turnstile_secret_is_refused() {
    let upstream = MockServer::start_async().await;
    let gateway = TestGateway::start(openai_config(upstream.base_url())).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/v1/auth/email-code", gateway.base_url))
        .json(&json!({ "email": "dev@relay.example", "turnstile_token": "tok" }))
        .send()
        .await
        .expect("response");
    assert_eq!(response.status().as_u16(), 403);
}

#[tokio::test]
async fn status_endpoint_reports_providers() {
    let upstream = MockServer::start_async().await;
    let gateway = TestGateway::start(openai_config(upstream.base_url())).await;
    let client = reqwest::Client::new();
    let body: Value = client
        .get(format!("{}/v1/status", gateway.base_url))
        .send()
        .await
        .expect("response")
        .json()
        .await
        .expect("json");
    assert_eq!(body["status"], "ok");
    assert!(body["providers"]
        .as_array()
        .expect("providers")
        .iter()
        .any(|name| name == "openai"));
}
