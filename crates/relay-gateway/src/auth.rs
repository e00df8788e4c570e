//! Bearer-token authentication against the persisted token table.

use axum::http::HeaderMap;
use relay_store::{Store, TokenIdentity};
use tracing::debug;

use crate::types::GatewayApiError;

/// Resolves the request's bearer token to its owning identity.
pub fn authenticate(headers: &HeaderMap, store: &Store) -> Result<TokenIdentity, GatewayApiError> {
    let token = bearer_token(headers).ok_or_else(GatewayApiError::unauthorized)?;
    match store.lookup_token(token) {
        Ok(Some(identity)) => Ok(identity),
        Ok(None) => {
            debug!("unknown bearer token");
            Err(GatewayApiError::unauthorized())
        }
        Err(error) => {
            tracing::error!(%error, "token lookup failed");
            Err(GatewayApiError::unauthorized())
        }
    }
}

/// Enforces a token's model whitelist when one is attached.
pub fn enforce_model_restriction(
    identity: &TokenIdentity,
    model: &str,
) -> Result<(), GatewayApiError> {
    if let Some(whitelist) = &identity.model_whitelist {
        if !whitelist.iter().any(|allowed| allowed == model) {
            return Err(GatewayApiError::unauthorized());
        }
    }
    Ok(())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    // Both `Authorization: Bearer <t>` and Anthropic's `x-api-key` style are
    // accepted; compat clients use either.
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Anthropic-compat clients send `x-api-key` instead of a bearer header.
pub fn api_key_or_bearer(headers: &HeaderMap) -> HeaderMap {
    let mut effective = headers.clone();
    if !effective.contains_key("authorization") {
        if let Some(key) = headers.get("x-api-key").cloned() {
            if let Ok(value) = key.to_str() {
                if let Ok(header) = format!("Bearer {value}").parse() {
                    effective.insert("authorization", header);
                }
            }
        }
    }
    effective
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn functional_bearer_lookup_round_trip() {
        let store = Store::open_in_memory().expect("store");
        let user = store.create_user("dave", None).expect("user");
        let token = store.create_token(user.id, "cli", None).expect("token");

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            format!("Bearer {}", token.token).parse().expect("header"),
        );
        let identity = authenticate(&headers, &store).expect("identity");
        assert_eq!(identity.user_id, user.id);
        assert_eq!(identity.username, "dave");
    }

    #[test]
    fn unit_missing_and_unknown_tokens_are_unauthorized() {
        let store = Store::open_in_memory().expect("store");
        let headers = HeaderMap::new();
        assert!(authenticate(&headers, &store).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer rk-nope".parse().expect("header"));
        assert!(authenticate(&headers, &store).is_err());
    }

    #[test]
    fn unit_x_api_key_promotes_to_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "rk-abc".parse().expect("header"));
        let effective = api_key_or_bearer(&headers);
        assert_eq!(
            effective.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer rk-abc")
        );
    }

    #[test]
    fn unit_whitelist_blocks_foreign_models() {
        let identity = TokenIdentity {
            token_id: 1,
            token_name: "cli".to_string(),
            user_id: 1,
            username: "dave".to_string(),
            model_whitelist: Some(vec!["gpt-4o".to_string()]),
        };
        assert!(enforce_model_restriction(&identity, "gpt-4o").is_ok());
        assert!(enforce_model_restriction(&identity, "claude-3-5-sonnet").is_err());

        let open = TokenIdentity {
            model_whitelist: None,
            ..identity
        };
        assert!(enforce_model_restriction(&open, "anything").is_ok());
    }
}
