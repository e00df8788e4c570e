//! SQLite persistence for the gateway.
//!
//! One connection behind a mutex, WAL journal, schema applied on open.
//! The store implements the narrow contracts the orchestrator
//! ([`relay_chat::ChatStore`]) and the usage plane
//! ([`relay_usage::UsageStore`]) depend on, plus the user/token surface the
//! HTTP layer needs for bearer auth.

mod schema;
mod store;

pub use store::{ApiToken, Store, StoreError, TokenIdentity, User};
