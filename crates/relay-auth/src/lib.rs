//! Credential-boundary primitives: OAuth code exchange, email verification
//! codes, and the Cloudflare Turnstile verifier.
//!
//! Everything here is a primitive consumed by the session/HTTP layer; no
//! session state lives in this crate.

mod email_code;
mod oauth;
mod turnstile;

pub use email_code::{EmailCodeIssuer, DEFAULT_CODE_TTL_MS};
pub use oauth::{AuthError, OAuthClient, OAuthConfig, OAuthTokens};
pub use turnstile::{TurnstileVerifier, TURNSTILE_VERIFY_URL};
