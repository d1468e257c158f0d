use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshgate::api;
use meshgate::app::App;
use meshgate::cli;
use meshgate::gate::GateHandler;
use meshgate::rpc::TcpRpcListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshgate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings();
    let listen_address: IpAddr = settings
        .listen_address
        .parse::<IpAddr>()
        .context("Invalid ip address")?;
    let http_address = SocketAddr::from((listen_address, settings.listen_port));
    let rpc_address = SocketAddr::from((listen_address, settings.listen_port_rpc));

    let app = App::builder(settings).build()?;

    // Gate nodes own client connections; the handler lives as long as main
    let gate = (app.local_node().service_name == "Gate").then(|| GateHandler::install(app.clone()));

    let rpc = TcpRpcListener::bind(rpc_address, app.server().clone())
        .await?
        .spawn();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat = app.status_reporter().spawn(shutdown_rx);

    // Start server
    info!("Starting meshgate node {} on {}", app.node_id(), http_address);
    axum::Server::bind(&http_address)
        .serve(api::api(app).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    let _ = heartbeat.await;
    rpc.abort();
    drop(gate);

    Ok(())
}
