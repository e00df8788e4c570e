//! The `relay` binary: configuration, wiring, and the serve loop.

mod bootstrap;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_auth::{EmailCodeIssuer, TurnstileVerifier};
use relay_chat::{ChatOrchestrator, ChatStore};
use relay_core::GatewayConfig;
use relay_cursor::{CursorTransport, SessionPool, DEFAULT_FAILURE_THRESHOLD};
use relay_gateway::{run_server, GatewayState};
use relay_provider::{ProviderAdapter, ProviderRouter};
use relay_store::Store;
use relay_usage::{RetentionSweeper, UsageStore, UsageTracker};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "LLM API gateway")]
struct Args {
    /// Bind address for the HTTP gateway.
    #[arg(long, default_value = "127.0.0.1:8080", env = "RELAY_BIND")]
    bind: String,

    /// SQLite database path.
    #[arg(long, default_value = "relay.db", env = "RELAY_DATABASE")]
    database: PathBuf,

    /// Optional TOML config file; environment variables win over it.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bootstrap::init_tracing();
    let args = Args::parse();
    let config = GatewayConfig::load(args.config.as_deref());

    let store = Arc::new(
        Store::open(&args.database)
            .with_context(|| format!("failed to open {}", args.database.display()))?,
    );

    // The Cursor transport joins the router as a plain adapter when either
    // the anti-bot script or a sessions file is configured.
    let cursor_wired = config.cursor.is_configured() || config.cursor.sessions_file.is_some();
    let (cursor_adapter, cursor_pool) = if cursor_wired {
        let pool = Arc::new(SessionPool::new(
            DEFAULT_FAILURE_THRESHOLD,
            config.cursor.sessions_file.clone(),
        ));
        if config.cursor.sessions_file.is_some() {
            if let Err(error) = pool.reload() {
                warn!(%error, "cursor session load failed, starting with an empty pool");
            }
        }
        let transport = Arc::new(CursorTransport::new(config.cursor.clone(), Arc::clone(&pool)));
        (
            Some(transport as Arc<dyn ProviderAdapter>),
            Some(pool),
        )
    } else {
        (None, None)
    };

    let router = Arc::new(ProviderRouter::from_settings(
        &config.providers,
        cursor_adapter,
    ));

    let (tracker, usage_worker) = UsageTracker::build(
        config.tracker.clone(),
        Arc::clone(&store) as Arc<dyn UsageStore>,
    );
    let tracker = Arc::new(tracker);
    let usage_worker_handle = tokio::spawn(usage_worker.run());

    let sweeper = RetentionSweeper::new(
        config.sweeper.clone(),
        Arc::clone(&store) as Arc<dyn UsageStore>,
    );
    sweeper.start();

    let orchestrator = ChatOrchestrator::new(
        Arc::clone(&store) as Arc<dyn ChatStore>,
        Arc::clone(&router),
        config.cursor.system_prompt_inject.clone(),
        config.cursor.max_input_length,
    );

    let state = Arc::new(GatewayState {
        turnstile: TurnstileVerifier::new(&config.turnstile),
        email_codes: EmailCodeIssuer::default(),
        config,
        store,
        router,
        orchestrator,
        tracker: Arc::clone(&tracker),
        cursor_pool,
    });

    run_server(&args.bind, state)
        .await
        .context("gateway server failed")?;

    // Orderly shutdown: close the usage queue, let the worker drain, stop
    // the sweeper.
    tracker.stop();
    let _ = usage_worker_handle.await;
    sweeper.stop().await;
    Ok(())
}
