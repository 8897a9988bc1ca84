//! Bifrost proxy entry point.

use anyhow::{anyhow, Context, Result};
use bifrost::cli::Args;
use bifrost::config::AppConfig;
use bifrost::{console, identity, logging, signals};
use clap::Parser;
use proxy_server::ProxyServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    let args = Args::parse();
    let workers = args.worker_threads();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("bifrost-worker")
        .enable_all()
        .build()
        .context("cannot build the async runtime")?;

    let result = runtime.block_on(run(args, workers));
    // The console's blocking stdin read never returns on its own.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(args: Args, workers: usize) -> Result<()> {
    let mut config = AppConfig::load_from_file(&args.config).await?;
    config.apply_overrides(&args);
    config
        .validate()
        .with_context(|| format!("configuration validation failed for {}", args.config.display()))?;

    logging::setup_logging(&config.logging)?;
    display_banner();

    let identity = identity::load_identity(&config.tls)?;
    let server = Arc::new(ProxyServer::new(config.to_proxy_config()?, identity)?);

    info!("📂 Config: {}", args.config.display());
    info!("  🌐 Bind address: {}", config.server.bind_address);
    info!("  🧵 Worker threads: {}", workers);
    info!("  👥 Max connections: {}", config.server.max_connections);
    info!(
        "  💓 Heartbeat: every {}ms, drain after {} missed",
        config.bridge.heartbeat_interval_ms, config.bridge.heartbeat_miss_threshold
    );
    for backend in &config.backends {
        info!(
            "  🖥️ Backend {} at {}{}",
            backend.name,
            backend.address,
            if backend.default_server { " (default)" } else { "" }
        );
    }

    let runner = server.clone();
    let mut server_task = tokio::spawn(async move { runner.start().await });
    let console = tokio::spawn(console::run_console(
        server.get_dispatcher(),
        BufReader::new(tokio::io::stdin()),
    ));
    info!("🛑 Press Ctrl+C to gracefully shutdown");

    tokio::select! {
        finished = &mut server_task => {
            console.abort();
            return match finished {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(anyhow!("server task failed: {}", e)),
            };
        }
        signal = signals::wait_for_shutdown_signal() => signal?,
    }

    info!("🛑 Shutdown signal received, initiating graceful shutdown...");
    console.abort();
    server.shutdown().await?;

    match tokio::time::timeout(SHUTDOWN_GRACE, server_task).await {
        Ok(Ok(Ok(()))) => info!("✅ Bifrost shutdown complete"),
        Ok(Ok(Err(e))) => error!("❌ Server error during shutdown: {}", e),
        Ok(Err(e)) => error!("❌ Server task failed: {}", e),
        Err(_) => warn!("⏳ Server did not stop within {:?}", SHUTDOWN_GRACE),
    }

    let stats = server.get_dispatcher().get_stats();
    info!(
        "📊 Events published: {} | Commands run: {}",
        stats.events_published, stats.commands_dispatched
    );
    Ok(())
}

fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║              🌈 BIFROST 🌈               ║");
    info!("║        QUIC Game Proxy v{:<16} ║", version);
    info!("╚══════════════════════════════════════════╝");
}
