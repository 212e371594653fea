use bridge_agent::agent::Agent;
use bridge_agent::config::{self, DEFAULT_CONFIG_PATH};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(version, about = "Relays cloud bridge requests to the local SCADA services")]
struct Args {
    /// Config file. Defaults to /etc/scada-bridge/agent.toml; built-in
    /// defaults apply when that file does not exist.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for structured logging to stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Both reqwest and tungstenite ride on rustls; pin the provider once.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(version = env!("CARGO_PKG_VERSION"), "bridge agent starting");

    let args = Args::parse();
    let loaded = match &args.config {
        Some(path) => config::load_config_from_path(path),
        None => config::load_config(),
    };
    let cfg = match loaded {
        Ok(cfg) => {
            info!(
                path = %args
                    .config
                    .as_deref()
                    .map_or_else(|| DEFAULT_CONFIG_PATH.to_owned(), |p| p.display().to_string()),
                local_api = %cfg.local_api.base_url,
                realtime = %cfg.realtime.url,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let agent = match Agent::start(&cfg).await {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("FATAL: failed to start agent: {}", e);
            std::process::exit(1);
        }
    };

    wait_for_signal().await;
    agent.shutdown().await;
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
            _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }
}
