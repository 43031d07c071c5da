use anyhow::{Context, Result};
use axum::serve;
use clap::Parser;
use rustls::crypto::{ring::default_provider, CryptoProvider};
use server::{logging, router};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use venn_core::{
    config::{parse_bind, AppConfig},
    metrics,
    runtime::{VennRuntime, DRAIN_TIMEOUT},
};

/// Multi-chain JSON-RPC reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "venn", version, about)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "SERVERCONFIG_PATH", default_value = "venn.yml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    CryptoProvider::install_default(default_provider())
        .map_err(|e| anyhow::anyhow!("Failed to install crypto provider: {e:?}"))?;

    let args = Args::parse();
    let config = AppConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    logging::init(&config.logging);
    info!(config = %args.config.display(), chains = config.chains.len(), "starting venn");

    let bind = parse_bind(&config.bind).context("invalid bind address")?;
    let metrics_bind = if config.metrics.disabled {
        None
    } else {
        Some(parse_bind(&config.metrics.bind).context("invalid metrics bind address")?)
    };

    let runtime = Arc::new(VennRuntime::builder().with_config(config).build()?);
    runtime.start().await?;

    if let Some(addr) = metrics_bind {
        metrics::init_prometheus_recorder();
        spawn_metrics_server(addr, runtime.root_token().clone()).await?;
    }

    let app = router::create_app(Arc::clone(&runtime));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(address = %bind, "venn listening");

    // Open WebSocket sessions end on the root token, so it must fire before the drain.
    let root = runtime.root_token().clone();
    let result = serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            root.cancel();
        })
        .await;
    if let Err(e) = result {
        error!(error = %e, "server error occurred");
    }

    runtime.shutdown().await;
    info!("venn stopped");
    Ok(())
}

async fn spawn_metrics_server(addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics on {addr}"))?;
    info!(address = %addr, "metrics listening");
    tokio::spawn(async move {
        let app = router::create_metrics_app();
        if let Err(e) =
            serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned()).await
        {
            error!(error = %e, "metrics server error occurred");
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!(
        "shutdown signal received, draining for up to {}s",
        DRAIN_TIMEOUT.as_secs()
    );
}
