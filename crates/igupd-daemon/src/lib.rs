pub mod device;
mod download;
pub mod error;
pub mod installer;
pub mod orchestrator;
pub mod routes;
pub mod state;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use igupd_core::bootenv::FwEnv;
use igupd_core::config::{DaemonConfig, SYSFS_NET_DIR};

use crate::device::{DeviceStatus, HookIndicator, LogIndicator};
use crate::installer::SwupdateInstaller;
use crate::orchestrator::{Collaborators, Orchestrator};

/// Build the axum Router with all RPC routes and middleware.
/// Used by `serve_on()` and available for integration testing.
pub fn build_router(app_state: state::AppState) -> Router {
    Router::new()
        .route("/api/configuration", post(routes::configuration::set_configuration))
        .route("/api/update/check", post(routes::update::check_update))
        .route("/api/update/snooze", post(routes::update::snooze_update))
        .route("/api/status", get(routes::status::get_status))
        .route("/api/events", get(routes::events::sse_events))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve the RPC façade on a pre-bound listener until `shutdown` fires.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    app_state: state::AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("igupd RPC listening on http://{addr}");

    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Run the daemon: installer supervision, orchestration and the RPC façade,
/// until `shutdown` fires.
pub async fn run(config: DaemonConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let device_id = config
        .device_id(Path::new(SYSFS_NET_DIR))
        .with_context(|| format!("reading MAC address of {}", config.network_interface))?;
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    let (handle, mailbox) = orchestrator::channel();
    let installer = Arc::new(SwupdateInstaller::spawn(
        &config.installer,
        handle.progress_handler(),
        shutdown.clone(),
    ));
    let device: Arc<dyn DeviceStatus> = match &config.indicator_hook {
        Some(hook) => Arc::new(HookIndicator::new(hook.clone())),
        None => Arc::new(LogIndicator),
    };
    let collaborators = Collaborators {
        boot_env: Arc::new(FwEnv::new(config.migrate_script.clone())),
        installer: installer.clone(),
        device,
        clock: orchestrator::system_clock(),
    };
    let orchestrator = Orchestrator::spawn(
        config,
        device_id,
        collaborators,
        mailbox,
        shutdown.clone(),
    );

    let served = serve_on(listener, state::AppState::new(handle), shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = orchestrator.await {
        tracing::error!("orchestrator task failed: {e}");
    }
    match Arc::try_unwrap(installer) {
        Ok(installer) => installer.join().await,
        Err(_) => tracing::warn!("installer still referenced at shutdown"),
    }
    tracing::info!("igupd stopped");
    served
}
