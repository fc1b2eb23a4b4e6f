use clap::Parser;
use fireproxy::config;
use fireproxy::server::ProxyServer;
use fireproxy::{ProxyError, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[cfg(feature = "fast-allocator")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "fireproxy")]
#[command(about = "Multi-rule layer-4 TCP/UDP forwarding proxy", long_about = None)]
#[command(version)]
struct Args {
    /// Rules file path
    #[arg(short, long, value_name = "FILE", default_value = "rules.json")]
    rules: PathBuf,

    /// Write a documented example rules file and exit
    #[arg(long, value_name = "FILE")]
    generate_rules: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = args.generate_rules {
        config::write_example_rules(&path)?;
        println!("Example rules file written to {}", path.display());
        return Ok(());
    }

    init_logging(&args.log_level)?;

    info!("fireproxy v{} starting", env!("CARGO_PKG_VERSION"));
    info!(rules_file = %args.rules.display(), "loading rules");

    let server = ProxyServer::start(&args.rules).await?;
    info!(rules_bound = server.rule_count(), "server running, waiting for shutdown signal");

    wait_for_shutdown_signal().await;

    server.shutdown();
    info!("shutdown complete");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received Ctrl+C"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for Ctrl+C");
    info!("received Ctrl+C");
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| ProxyError::Config(format!("invalid log level: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
