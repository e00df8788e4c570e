//! The Cursor transport: pooled browser sessions, anti-bot token minting,
//! and SSE relay.
//!
//! Everything here serves one capability: making a scraped Cursor web
//! session look like a regular [`relay_provider::ProviderAdapter`] to the
//! router.

mod antibot;
mod model_map;
mod pool;
mod transport;

pub use antibot::{AntiBotEngine, AntiBotError};
pub use model_map::{map_cursor_model, CURSOR_MODEL_MAP};
pub use pool::{CursorSession, NoSessionError, SessionPool, SessionStatus, DEFAULT_FAILURE_THRESHOLD};
pub use transport::CursorTransport;
