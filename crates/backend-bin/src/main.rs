use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_backend_lib::{
    auth::spawn_revocation_purge,
    config::Settings,
    store::MemStore,
    ws_router, AppState,
};

/// How often expired token revocations are swept out of the store.
const REVOCATION_PURGE_PERIOD: Duration = Duration::from_secs(15 * 60);

#[derive(Parser, Debug)]
#[command(name = "parley-backend", about = "Meeting coordination and signaling relay server")]
struct Args {
    /// Path to a TOML config file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = Settings::load_from(&args.config)
        .with_context(|| format!("loading settings from {}", args.config))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    if settings.signer_key.is_empty() {
        warn!("PARLEY_SIGNER_KEY is not set; tokens are signed with an empty secret");
    }

    let store = MemStore::default();
    let state = Arc::new(AppState::new(store.clone(), settings.clone()));

    spawn_revocation_purge(store, REVOCATION_PURGE_PERIOD);

    let app = ws_router::create_router(state);

    let listener = TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "listening");

    axum::serve(listener, app).await?;
    Ok(())
}
