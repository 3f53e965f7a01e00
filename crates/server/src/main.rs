//! Groupcast server binary

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use groupcast_server::directory::StaticDirectory;
use groupcast_server::realtime::ConnectionRegistry;
use groupcast_server::routes::create_router;
use groupcast_server::state::connect_realtime;
use groupcast_server::{AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine in production
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_json);

    tracing::info!(
        bind_address = %config.bind_address,
        backplane = %config.backplane,
        rooms = config.rooms.len(),
        "Starting groupcast server"
    );

    let registry = connect_realtime(&config)
        .await
        .context("Failed to initialise realtime layer")?;

    let state = AppState::new(
        config.clone(),
        Arc::clone(&registry),
        StaticDirectory::from_config(&config),
    );
    let disconnect_listener = state.chat.spawn_disconnect_listener();

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "Listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&registry)))
        .await
        .context("Server error")?;

    disconnect_listener.abort();
    registry.backplane().shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("groupcast_server=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolves on Ctrl-C or SIGTERM, after closing every open stream so the
/// graceful shutdown is not held up by long-lived SSE responses
async fn shutdown_signal(registry: Arc<ConnectionRegistry>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, closing connections");
    registry.shutdown().await;
}
