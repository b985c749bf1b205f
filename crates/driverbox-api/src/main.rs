//! driverbox - edge IoT gateway runtime

use driverbox_core::Settings;
use state::{AppState, StartupError};
use std::fs::OpenOptions;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod discovery;
mod gateway;
mod response;
mod state;

const LOG_FILE: &str = "driverbox.log";

/// Console output, plus `<log_path>/driverbox.log` when configured
fn init_tracing(settings: &Settings) -> Result<(), StartupError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", settings.log_level)));

    let file_layer = match &settings.log_path {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| StartupError::InitLogger(format!("{}: {e}", dir.display())))?;
            let path = dir.join(LOG_FILE);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StartupError::InitLogger(format!("{}: {e}", path.display())))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(file_layer)
        .with(filter)
        .try_init()
        .map_err(|e| StartupError::InitLogger(e.to_string()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    init_tracing(&settings)?;
    tracing::info!("Starting driverbox {}", env!("CARGO_PKG_VERSION"));

    let state = AppState::bootstrap(settings.clone()).await?;

    let discovery_task = match discovery::bind(settings.udp_discover_listen).await {
        Ok(socket) => Some(tokio::spawn(discovery::serve(
            socket,
            state.metadata.discovery(settings.http_listen),
        ))),
        Err(e) => {
            tracing::warn!(
                "UDP discovery disabled, cannot bind port {}: {}",
                settings.udp_discover_listen,
                e
            );
            None
        }
    };

    let app = api::router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_listen));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = discovery_task {
        task.abort();
    }
    state.shutdown().await;
    Ok(())
}
