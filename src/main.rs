//! Argus server binary: env-driven configuration, tracing, graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use argus::{ArgusConfig, ArgusServer};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| level.parse::<EnvFilter>().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match ArgusConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Configuration error");
            std::process::exit(1);
        }
    };
    let port = config.server.port;

    let server = match ArgusServer::new(config).await {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "Failed to initialize");
            std::process::exit(1);
        }
    };

    server.start_background_tasks().await;
    let router = server.clone().create_router().await;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, %addr, "Failed to bind");
            std::process::exit(1);
        }
    };
    info!(%addr, "Argus core listening");

    let shutdown_server = Arc::clone(&server);
    let result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        shutdown_server.shutdown().await;
    })
    .await;

    if let Err(err) = result {
        error!(error = %err, "Server error");
        std::process::exit(1);
    }
}
