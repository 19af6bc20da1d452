use anyhow::Context;
use clap::Parser;
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use wsgate::{Config, Router, server};

#[derive(Parser)]
#[clap(version, about = "A WebSocket reverse proxy that rewrites frames in flight")]
struct Args {
    #[clap(
        short,
        long,
        value_name = "FILE",
        default_value = "./config.yaml",
        help = "Configuration file path"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;

    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(config.global.log_level.to_filter())
        .init();

    let router = Arc::new(Router::from_config(&config).context("invalid routing configuration")?);

    let shutdown = CancellationToken::new();
    let mut listeners = Vec::new();
    for addr in config.listen_addrs() {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("listening on {addr}");
        listeners.push(tokio::spawn(server::run(
            listener,
            Arc::clone(&router),
            shutdown.clone(),
        )));
    }

    wait_for_shutdown().await;
    info!("shutting down");
    shutdown.cancel();
    for listener in listeners {
        let _ = listener.await;
    }
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
