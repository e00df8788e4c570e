//! Shared gateway state wired by the binary.

use std::sync::Arc;

use relay_auth::{EmailCodeIssuer, TurnstileVerifier};
use relay_chat::ChatOrchestrator;
use relay_core::GatewayConfig;
use relay_cursor::SessionPool;
use relay_provider::ProviderRouter;
use relay_store::Store;
use relay_usage::UsageTracker;

/// Everything a request handler needs, injected once at startup.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub store: Arc<Store>,
    pub router: Arc<ProviderRouter>,
    pub orchestrator: ChatOrchestrator,
    pub tracker: Arc<UsageTracker>,
    pub turnstile: TurnstileVerifier,
    pub email_codes: EmailCodeIssuer,
    /// Present when the Cursor transport is wired; drives the status plane.
    pub cursor_pool: Option<Arc<SessionPool>>,
}
