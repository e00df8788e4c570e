//! Provider adapters and the model router.
//!
//! Defines the chat wire types and the [`ProviderAdapter`] capability, the
//! native OpenAI-family/Anthropic/Google adapters, and the configuration-
//! driven router that picks an adapter per model. The Cursor transport lives
//! in its own crate and is injected here as just another adapter, keeping the
//! provider/service dependency one-way.

mod adapter;
mod anthropic;
mod free_models;
mod google;
mod openai;
mod router;
mod sse;
mod types;

pub use adapter::{EventReceiver, EventSender, ProviderAdapter};
pub use anthropic::{AnthropicAdapter, ANTHROPIC_VERSION};
pub use free_models::free_model_catalog;
pub use google::GoogleAdapter;
pub use openai::OpenAiCompatAdapter;
pub use router::ProviderRouter;
pub use types::{ChatRequest, Message, MessageRole, ModelInfo, ToolChoice, ToolDefinition};
