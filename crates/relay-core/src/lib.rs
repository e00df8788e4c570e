//! Foundational utilities shared across relay crates.
//!
//! Provides environment-driven configuration, time helpers, request-id and
//! pseudo-random id material, and the closed gateway error taxonomy used by
//! every crate on the request path.

pub mod config;
pub mod error;
pub mod ids;
pub mod time_utils;

pub use config::{
    CursorSettings, GatewayConfig, ProviderEndpoint, ProviderSettings, SweeperSettings,
    TrackerSettings, TurnstileSettings,
};
pub use error::{map_http_status, map_message, ErrorKind, RelayError};
pub use ids::{mix64, new_request_id, random_id};
pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, cutoff_unix_ms, is_expired_unix,
};
