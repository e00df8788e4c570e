//! The HTTP gateway: OpenAI- and Anthropic-compatible chat endpoints over
//! the provider plane, with SSE streaming out and usage accounting on
//! completion.

mod anthropic_compat;
mod auth;
mod openai_compat;
mod server;
mod state;
mod status;
mod translate;
mod types;

pub use server::{build_router, run_server, serve};
pub use state::GatewayState;
pub use types::GatewayApiError;
