//! Duel Arena Server
//!
//! Binary entry point: configure logging, load `DUEL_*` settings and serve
//! until Ctrl-C.

use std::sync::Arc;
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use duel_arena::{DuelServer, ServerConfig, VERSION};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::from_env();
    info!("Duel Arena Server v{}", VERSION);
    info!(
        "Rank range: {}, max username length: {}",
        config.lobby.rank_range, config.lobby.max_username_len
    );

    let bind_addr = config.bind_addr;
    let server = Arc::new(DuelServer::new(config));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Ctrl-C received, shutting down");
        signal_server.shutdown();
    });

    server
        .run()
        .await
        .with_context(|| format!("duel server on {} failed", bind_addr))?;
    Ok(())
}
