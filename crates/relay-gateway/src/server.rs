//! Router wiring and the serve loop.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::anthropic_compat::handle_messages;
use crate::openai_compat::handle_chat_completions;
use crate::state::GatewayState;
use crate::status::{handle_email_code, handle_email_verify, handle_models, handle_status};

/// Builds the gateway router over shared state.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/models", get(handle_models))
        .route("/v1/status", get(handle_status))
        .route("/v1/auth/email-code", post(handle_email_code))
        .route("/v1/auth/email-verify", post(handle_email_verify))
        .with_state(state)
}

/// Serves the gateway on an already-bound listener until the task is
/// cancelled or the listener fails.
pub async fn serve(listener: TcpListener, state: Arc<GatewayState>) -> std::io::Result<()> {
    axum::serve(listener, build_router(state)).await
}

/// Binds and serves until ctrl-c.
pub async fn run_server(bind: &str, state: Arc<GatewayState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "gateway listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
}
