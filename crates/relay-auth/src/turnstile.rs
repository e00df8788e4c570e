//! Cloudflare Turnstile verification.

use relay_core::TurnstileSettings;
use serde::Deserialize;
use tracing::warn;

use crate::oauth::AuthError;

/// Cloudflare's siteverify endpoint.
pub const TURNSTILE_VERIFY_URL: &str =
    "https://challenges.cloudflare.com/turnstile/v0/siteverify";

#[derive(Debug, Deserialize)]
struct SiteverifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Verifies Turnstile challenge responses.
///
/// A missing secret refuses every request rather than failing open.
pub struct TurnstileVerifier {
    client: reqwest::Client,
    secret: Option<String>,
    verify_url: String,
}

impl TurnstileVerifier {
    pub fn new(settings: &TurnstileSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret: settings
                .secret_key
                .clone()
                .filter(|secret| !secret.trim().is_empty()),
            verify_url: TURNSTILE_VERIFY_URL.to_string(),
        }
    }

    /// Points the verifier at a different siteverify endpoint.
    pub fn with_verify_url(mut self, verify_url: impl Into<String>) -> Self {
        self.verify_url = verify_url.into();
        self
    }

    /// Returns whether Cloudflare accepted the challenge response.
    pub async fn verify(
        &self,
        response_token: &str,
        remote_ip: Option<&str>,
    ) -> Result<bool, AuthError> {
        let Some(secret) = &self.secret else {
            warn!("turnstile secret not configured, refusing verification");
            return Ok(false);
        };

        let mut form = vec![
            ("secret", secret.as_str()),
            ("response", response_token),
        ];
        if let Some(remote_ip) = remote_ip {
            form.push(("remoteip", remote_ip));
        }

        let response = self
            .client
            .post(&self.verify_url)
            .form(&form)
            .send()
            .await
            .map_err(|error| AuthError::Http(error.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|error| AuthError::Http(error.to_string()))?;
        if status != 200 {
            return Err(AuthError::Upstream { status, body });
        }

        let parsed: SiteverifyResponse =
            serde_json::from_str(&body).map_err(|error| AuthError::Decode(error.to_string()))?;
        if !parsed.success && !parsed.error_codes.is_empty() {
            warn!(codes = ?parsed.error_codes, "turnstile verification refused");
        }
        Ok(parsed.success)
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    fn settings(secret: Option<&str>) -> TurnstileSettings {
        TurnstileSettings {
            secret_key: secret.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn functional_successful_challenge_is_accepted() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/siteverify")
                    .body_includes("secret=ts-secret")
                    .body_includes("response=challenge-token")
                    .body_includes("remoteip=10.0.0.1");
                then.status(200)
                    .json_body(serde_json::json!({ "success": true }));
            })
            .await;

        let verifier = TurnstileVerifier::new(&settings(Some("ts-secret")))
            .with_verify_url(format!("{}/siteverify", server.base_url()));
        let accepted = verifier
            .verify("challenge-token", Some("10.0.0.1"))
            .await
            .expect("verify");
        assert!(accepted);
    }

    #[tokio::test]
    async fn unit_failed_challenge_is_refused() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/siteverify");
                then.status(200).json_body(serde_json::json!({
                    "success": false,
                    "error-codes": ["invalid-input-response"]
                }));
            })
            .await;

        let verifier = TurnstileVerifier::new(&settings(Some("ts-secret")))
            .with_verify_url(format!("{}/siteverify", server.base_url()));
        assert!(!verifier.verify("bad", None).await.expect("verify"));
    }

    #[tokio::test]
    async fn regression_missing_secret_refuses_without_calling_cloudflare() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/siteverify");
                then.status(200)
                    .json_body(serde_json::json!({ "success": true }));
            })
            .await;

        let verifier = TurnstileVerifier::new(&settings(None))
            .with_verify_url(format!("{}/siteverify", server.base_url()));
        assert!(!verifier.verify("anything", None).await.expect("verify"));
        mock.assert_calls_async(0).await;
    }
}
