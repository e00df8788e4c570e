//! The provider capability consumed by the router and orchestrator.

use async_trait::async_trait;
use relay_core::RelayError;
use relay_stream::StreamEvent;
use tokio::sync::mpsc;

use crate::types::{ChatRequest, ModelInfo};

/// Sending half of a response stream; owned by the producer task.
pub type EventSender = mpsc::UnboundedSender<StreamEvent>;
/// Receiving half handed to the caller.
pub type EventReceiver = mpsc::UnboundedReceiver<StreamEvent>;

/// Capability implemented by every upstream transport, native or scraped.
///
/// `chat_completion` resolves once the upstream accepted the request; the
/// stream itself arrives on the returned channel. Producers stop promptly
/// when the receiver is dropped, which is how request cancellation
/// propagates.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the adapter can currently serve requests (credentials present,
    /// sessions available, ...).
    fn is_available(&self) -> bool;

    fn supported_models(&self) -> Vec<ModelInfo>;

    async fn chat_completion(&self, request: ChatRequest) -> Result<EventReceiver, RelayError>;

    /// Session-pooled transports report which credential served a request so
    /// usage records can attribute it. Keyed by the request id; the value is
    /// surrendered on first read.
    fn take_session_label(&self, _request_id: &str) -> Option<String> {
        None
    }
}

impl std::fmt::Debug for dyn ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("name", &self.name())
            .finish()
    }
}

/// Folds a reqwest transport failure into the closed taxonomy.
pub(crate) fn map_transport_error(
    provider: &str,
    request: &ChatRequest,
    error: &reqwest::Error,
) -> RelayError {
    let kind = if error.is_timeout() {
        relay_core::ErrorKind::Timeout
    } else {
        relay_core::ErrorKind::ProviderError
    };
    let mut mapped = RelayError::new(kind, format!("transport failure: {error}"))
        .with_provider(provider)
        .with_model(request.model.clone());
    if let Some(request_id) = &request.request_id {
        mapped = mapped.with_request_id(request_id.clone());
    }
    mapped
}

/// Folds a non-2xx upstream response into the closed taxonomy.
pub(crate) fn map_upstream_status(
    provider: &str,
    request: &ChatRequest,
    status: u16,
    body: &str,
) -> RelayError {
    let mut mapped = RelayError::from_upstream_status(status, body)
        .with_provider(provider)
        .with_model(request.model.clone());
    if let Some(request_id) = &request.request_id {
        mapped = mapped.with_request_id(request_id.clone());
    }
    mapped
}
