use anyhow::{Context, Result};
use igupd_core::config::DaemonConfig;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Run the update daemon in the foreground until SIGINT or SIGTERM.
pub fn run(config_path: &Path) -> Result<()> {
    let config = DaemonConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let shutdown = CancellationToken::new();
        tokio::spawn(cancel_on_signal(shutdown.clone()));
        igupd_daemon::run(config, shutdown).await
    })
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted, shutting down"),
        _ = term.recv() => tracing::info!("terminated, shutting down"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
