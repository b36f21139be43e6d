use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use axum::routing::{get, post};
use axum::{Extension, Router};
use tracing::info;

mod app;
mod balancer;
mod cache;
mod config;
mod dispatcher;
mod errors;
mod frontend;
mod health;
mod http_client;
mod jsonrpc;
mod metrics;
mod rate;
mod registry;

/// A JSON-RPC relay balancing requests across a pool of upstream endpoints.
#[derive(FromArgs)]
struct Cli {
    /// path to the relay's YAML configuration file
    #[argh(option, default = "PathBuf::from(\"relay.yaml\")")]
    config: PathBuf,

    /// override relay.host/relay.port, e.g. 0.0.0.0:8080
    #[argh(option)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli: Cli = argh::from_env();

    let (app, stop_tx, handles) = app::App::spawn(cli.config.clone())
        .await
        .context("failed to start relay")?;

    let snapshot = app.registry.current().snapshot.clone();
    let (host, port) = resolve_bind(&cli.bind, &snapshot.host, snapshot.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("parsing bind address {host}:{port}"))?;

    let router = Router::new()
        .route("/", post(frontend::http::rpc_handler).get(frontend::http::liveness))
        .route("/status", get(frontend::http::status_handler))
        .layer(Extension(app));

    info!(%addr, "listening");

    let server = axum::Server::try_bind(&addr)
        .with_context(|| format!("binding {addr}"))?
        .serve(router.into_make_service());

    tokio::select! {
        res = server => { res.context("http server error")?; }
        _ = shutdown_signal() => { info!("shutdown signal received"); }
    }

    drop(stop_tx);
    app::flatten_handles(handles).await?;

    Ok(())
}

fn resolve_bind(bind: &Option<String>, default_host: &str, default_port: u16) -> (String, u16) {
    match bind {
        Some(bind) => {
            let mut parts = bind.splitn(2, ':');
            let host = parts.next().unwrap_or(default_host).to_string();
            let port = parts.next().and_then(|p| p.parse().ok()).unwrap_or(default_port);
            (host, port)
        }
        None => (default_host.to_string(), default_port),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
