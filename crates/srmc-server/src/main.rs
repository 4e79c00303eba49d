mod config;
mod listener;
mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use srmc_gateway::collaborators::JwtVerifier;
use srmc_gateway::{Collaborators, Gateway};
use srmc_types::CloseCode;

use crate::config::ServerConfig;

/// How long open sockets get to flush their close frames on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "srmc=debug,srmc_gateway=debug,srmc::audit=info,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    if let Err(e) = config.validate() {
        eprintln!("FATAL: {}", e);
        eprintln!("       Fix your .env file and restart.");
        std::process::exit(1);
    }
    if config.uses_placeholder_secret() {
        warn!("SRMC_JWT_SECRET is a development placeholder; do not expose this server");
    }
    if !config.production {
        warn!("Development mode: plaintext upgrades are accepted");
    }

    let verifier = Arc::new(JwtVerifier::new(&config.jwt_secret));
    let gateway = Gateway::new(config.gateway.clone(), Collaborators::new(verifier));

    let app = srmc_gateway::router(gateway.clone()).layer(TraceLayer::new_for_http());
    let shutdown = CancellationToken::new();

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let plain = tokio::net::TcpListener::bind(addr).await?;
    info!("SRMC gateway listening on ws://{}/gateway", addr);
    let mut listeners = vec![tokio::spawn(listener::run_plain(plain, app.clone(), shutdown.clone()))];

    if let Some(acceptor) = tls::build_tls_acceptor(&config)? {
        let tls_addr: SocketAddr = format!("{}:{}", config.host, config.tls_port).parse()?;
        let tls_listener = tokio::net::TcpListener::bind(tls_addr).await?;
        info!("SRMC gateway listening on wss://{}/gateway", tls_addr);
        listeners.push(tokio::spawn(listener::run_tls(
            tls_listener,
            acceptor,
            app,
            shutdown.clone(),
        )));
    }

    info!(
        "Origins: {:?}, rate limit {}/{:?} soft, {}/{:?} hard",
        config.gateway.allowed_origins,
        config.gateway.rate.soft_limit,
        config.gateway.rate.window,
        config.gateway.rate.hard_limit,
        config.gateway.rate.hard_window,
    );

    shutdown_signal().await;
    shutdown.cancel();
    for handle in listeners {
        let _ = handle.await;
    }

    let open = gateway.registry().connection_count().await;
    info!("Closing {} open connection(s)", open);
    gateway.registry().terminate_all(CloseCode::GoingAway).await;

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while gateway.registry().connection_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Shutdown drain timed out; dropping remaining connections");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
