use std::sync::Arc;

use tokio::net::TcpListener;

use relay_server::config::Config;
use relay_server::registry::Registry;
use relay_server::routes;
use relay_server::state::AppState;
use relay_server::transport::tcp;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "relay_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "relay_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("relay server v{} starting", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(Registry::new());
    let state = AppState::new(registry, config.idle_timeout());

    // Optional raw TCP listener alongside the WebSocket endpoint. Both drive
    // the same registry, so clients on either transport see each other.
    if let Some(tcp_port) = config.tcp_port {
        let addr = format!("{}:{}", config.bind_address, tcp_port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "raw TCP listener bound");
        tokio::spawn(tcp::serve(listener, state.clone()));
    }

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "http listener bound");

    let app = routes::build_router(state);
    axum::serve(listener, app).await?;

    Ok(())
}
