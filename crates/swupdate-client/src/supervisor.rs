use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::{classify_exit, log_exit, ExitOutcome, InstallerProcess};
use crate::wire::{ProgressFrame, ProgressRecord, PROGRESS_FRAME_LEN};

/// Exit code reported when the installer could not be started at all.
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;

/// Receives every progress record, in stream order. Called from the
/// supervisor task, so it must not block.
pub type ProgressHandler = Arc<dyn Fn(ProgressRecord) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub progress_socket: PathBuf,
    /// How long to keep trying to reach the progress socket after launch.
    pub connect_timeout: Duration,
    pub connect_retry: Duration,
    /// Pause between one installer run ending and the next starting.
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            progress_socket: PathBuf::from("/tmp/swupdateprog"),
            connect_timeout: Duration::from_secs(10),
            connect_retry: Duration::from_millis(500),
            restart_delay: Duration::from_secs(3),
        }
    }
}

// ─── SupervisorHandle ─────────────────────────────────────────────────────

/// Control surface of a running supervisor.
///
/// The supervisor launches the current command, relays its progress, waits
/// for it to exit, sleeps, and starts over until shut down. An empty command
/// means "wait for one".
pub struct SupervisorHandle {
    command: watch::Sender<Vec<String>>,
    restart: watch::Sender<u64>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn spawn(
        config: SupervisorConfig,
        handler: ProgressHandler,
        shutdown: CancellationToken,
    ) -> Self {
        let (command, command_rx) = watch::channel(Vec::new());
        let (restart, restart_rx) = watch::channel(0u64);
        let task = tokio::spawn(supervise(
            config,
            handler,
            command_rx,
            restart_rx,
            shutdown.clone(),
        ));
        Self {
            command,
            restart,
            shutdown,
            task,
        }
    }

    /// Replace the command used for the next launch. A running installer is
    /// left alone.
    pub fn set_command(&self, argv: Vec<String>) {
        self.command.send_replace(argv);
    }

    /// Stop the running installer, if any, so the next cycle starts with
    /// the current command.
    pub fn restart(&self) {
        self.restart.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn launch(&self, argv: Vec<String>) {
        self.set_command(argv);
        self.restart();
    }

    /// Stop supervising, killing the installer, and wait for the task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

// ─── Supervision loop ─────────────────────────────────────────────────────

async fn supervise(
    config: SupervisorConfig,
    handler: ProgressHandler,
    mut command_rx: watch::Receiver<Vec<String>>,
    mut restart_rx: watch::Receiver<u64>,
    shutdown: CancellationToken,
) {
    loop {
        restart_rx.borrow_and_update();
        let argv = command_rx.borrow_and_update().clone();

        if argv.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = command_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        if run_once(&config, &handler, &argv, &mut restart_rx, &shutdown)
            .await
            .is_break()
        {
            break;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.restart_delay) => {}
        }
    }
    debug!("installer supervision stopped");
}

/// One launch → relay → wait cycle. `Break` means shutdown was requested.
async fn run_once(
    config: &SupervisorConfig,
    handler: &ProgressHandler,
    argv: &[String],
    restart_rx: &mut watch::Receiver<u64>,
    shutdown: &CancellationToken,
) -> ControlFlow<()> {
    info!(command = %argv.join(" "), "launching installer");
    let mut process = match InstallerProcess::spawn(argv) {
        Ok(p) => p,
        Err(e) => {
            warn!("failed to launch installer: {e}");
            handler(ProgressRecord::bad_command(SPAWN_FAILED_EXIT_CODE));
            return ControlFlow::Continue(());
        }
    };

    let mut restart_open = true;

    {
        let relay = relay_progress(config, handler);
        tokio::pin!(relay);
        loop {
            tokio::select! {
                _ = &mut relay => break,
                changed = restart_rx.changed(), if restart_open => {
                    match changed {
                        Ok(()) => {
                            info!("installer restart requested");
                            process.terminate();
                        }
                        Err(_) => restart_open = false,
                    }
                }
                _ = shutdown.cancelled() => {
                    process.kill_if_running().await;
                    return ControlFlow::Break(());
                }
            }
        }
    }

    let status = loop {
        tokio::select! {
            status = process.wait() => break status,
            changed = restart_rx.changed(), if restart_open => {
                match changed {
                    Ok(()) => {
                        info!("installer restart requested");
                        process.terminate();
                    }
                    Err(_) => restart_open = false,
                }
            }
            _ = shutdown.cancelled() => {
                process.kill_if_running().await;
                return ControlFlow::Break(());
            }
        }
    };

    match status {
        Ok(status) => {
            let outcome = classify_exit(status);
            log_exit(outcome);
            if let ExitOutcome::Failed(code) = outcome {
                handler(ProgressRecord::bad_command(code));
            }
        }
        Err(e) => warn!("failed to wait for installer: {e}"),
    }
    process.kill_if_running().await;
    ControlFlow::Continue(())
}

/// Connect to the progress socket and forward records until it closes.
async fn relay_progress(config: &SupervisorConfig, handler: &ProgressHandler) {
    let Some(mut stream) = connect_progress(config).await else {
        return;
    };
    debug!("progress connection established");

    let mut frame = vec![0u8; PROGRESS_FRAME_LEN];
    loop {
        match stream.read_exact(&mut frame).await {
            Ok(_) => match ProgressFrame::decode(&frame) {
                Ok(decoded) => {
                    let record = decoded.record();
                    debug!(
                        status = record.status.code(),
                        image = record.image.as_deref().unwrap_or(""),
                        info = %record.info,
                        "installer progress"
                    );
                    handler(record);
                }
                Err(e) => warn!("undecodable progress frame: {e}"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                warn!("progress socket read failed: {e}");
                break;
            }
        }
    }
    debug!("progress connection closed");
}

async fn connect_progress(config: &SupervisorConfig) -> Option<UnixStream> {
    let deadline = Instant::now() + config.connect_timeout;
    loop {
        match UnixStream::connect(&config.progress_socket).await {
            Ok(stream) => return Some(stream),
            Err(e) => {
                if Instant::now() >= deadline {
                    warn!(
                        socket = %config.progress_socket.display(),
                        "progress socket unavailable, not relaying progress: {e}"
                    );
                    return None;
                }
                tokio::time::sleep(config.connect_retry).await;
            }
        }
    }
}
