//! Model listing, status plane, and the email-verification endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::authenticate;
use crate::state::GatewayState;
use crate::types::GatewayApiError;

/// `GET /v1/models`: router union plus the free catalogue.
pub(crate) async fn handle_models(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(error) = authenticate(&headers, &state.store) {
        return error.into_response();
    }

    let data: Vec<_> = state
        .router
        .all_models()
        .into_iter()
        .map(|model| {
            json!({
                "id": model.id,
                "object": "model",
                "owned_by": model.provider,
                "input_price_per_million": model.input_price_per_million,
                "output_price_per_million": model.output_price_per_million,
                "free": model.free,
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data })).into_response()
}

/// `GET /v1/status`: ops-plane summary, no auth required.
pub(crate) async fn handle_status(State(state): State<Arc<GatewayState>>) -> Response {
    let (valid, total) = state
        .cursor_pool
        .as_ref()
        .map(|pool| pool.counts())
        .unwrap_or((0, 0));
    Json(json!({
        "status": "ok",
        "providers": state.router.provider_names(),
        "cursor_sessions": { "valid": valid, "total": total },
        "usage_tracking": state.tracker.is_enabled(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmailCodeRequest {
    email: String,
    #[serde(default)]
    turnstile_token: String,
}

/// `POST /v1/auth/email-code`: Turnstile-gated code issuance.
///
/// The code itself goes to the mailer collaborator; the response only
/// acknowledges dispatch.
pub(crate) async fn handle_email_code(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<EmailCodeRequest>,
) -> Response {
    if request.email.trim().is_empty() || !request.email.contains('@') {
        return GatewayApiError::bad_request("a valid email is required").into_response();
    }

    match state.turnstile.verify(&request.turnstile_token, None).await {
        Ok(true) => {}
        Ok(false) => {
            return GatewayApiError::new(
                axum::http::StatusCode::FORBIDDEN,
                "TURNSTILE_REFUSED",
                "challenge verification failed",
            )
            .into_response();
        }
        Err(error) => {
            tracing::warn!(%error, "turnstile verification errored");
            return GatewayApiError::new(
                axum::http::StatusCode::FORBIDDEN,
                "TURNSTILE_REFUSED",
                "challenge verification failed",
            )
            .into_response();
        }
    }

    let code = state.email_codes.issue(&request.email);
    // Dispatch is the mailer collaborator's job; only acknowledge here.
    info!(email = %request.email, code_len = code.len(), "verification code issued");
    Json(json!({ "sent": true })).into_response()
}

#[derive(Debug, Deserialize)]
pub(crate) struct EmailVerifyRequest {
    email: String,
    code: String,
}

/// `POST /v1/auth/email-verify`: checks and consumes a code.
pub(crate) async fn handle_email_verify(
    State(state): State<Arc<GatewayState>>,
    Json(request): Json<EmailVerifyRequest>,
) -> Response {
    let verified = state.email_codes.verify(&request.email, &request.code);
    Json(json!({ "verified": verified })).into_response()
}
