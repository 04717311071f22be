use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::wire::{decode_reply, encode_enable, Reply};
use crate::{Result, SwupdateError};

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub socket: PathBuf,
    /// Connect attempts per send; the installer may not be listening yet.
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub response_timeout: Duration,
    /// Wait before retrying a failed send.
    pub retry_delay: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/tmp/sockinstctrl"),
            connect_attempts: 5,
            connect_delay: Duration::from_secs(5),
            response_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_secs(10),
        }
    }
}

// ─── SuricattaControl ─────────────────────────────────────────────────────

/// Enables or disables the installer's server client.
///
/// Requests are coalesced: the sender task reads the desired value only
/// after a connection is up, so a value superseded while connecting or
/// waiting to retry is never sent.
pub struct SuricattaControl {
    desired: watch::Sender<Option<bool>>,
    task: JoinHandle<()>,
}

impl SuricattaControl {
    pub fn spawn(config: ControlConfig, shutdown: CancellationToken) -> Self {
        let (desired, rx) = watch::channel(None);
        let task = tokio::spawn(run(config, rx, shutdown));
        Self { desired, task }
    }

    pub fn set_enabled(&self, enable: bool) {
        debug!(enable, "download enable requested");
        self.desired.send_replace(Some(enable));
    }

    /// Wait for the sender task to finish after the shutdown token fired.
    pub async fn join(self) {
        drop(self.desired);
        let _ = self.task.await;
    }
}

async fn run(
    config: ControlConfig,
    mut rx: watch::Receiver<Option<bool>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        loop {
            match send_latest(&config, &mut rx).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("download control request failed, retrying: {e}");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(config.retry_delay) => {}
                    }
                }
            }
        }
    }
}

/// Connect, then send whatever value is current at that moment.
async fn send_latest(
    config: &ControlConfig,
    rx: &mut watch::Receiver<Option<bool>>,
) -> Result<()> {
    let mut stream = connect(config).await?;

    let Some(enable) = *rx.borrow_and_update() else {
        return Ok(());
    };
    let frame = encode_enable(enable)?;
    stream.write_all(&frame).await?;

    let mut reply = [0u8; 64];
    let n = tokio::time::timeout(config.response_timeout, stream.read(&mut reply))
        .await
        .map_err(|_| SwupdateError::ResponseTimeout(config.response_timeout.as_secs()))??;

    let action = if enable { "enable" } else { "disable" };
    match decode_reply(&reply[..n]) {
        Some(Reply::Nack) => warn!("installer rejected download {action}"),
        Some(Reply::Ack) | None => info!("download {action} message sent"),
        Some(Reply::Unknown(kind)) => debug!(kind, "unexpected reply to download {action}"),
    }
    Ok(())
}

async fn connect(config: &ControlConfig) -> Result<UnixStream> {
    let mut attempt = 0;
    loop {
        match UnixStream::connect(&config.socket).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempt += 1;
                if attempt >= config.connect_attempts {
                    return Err(e.into());
                }
                debug!(attempt, "control socket not ready: {e}");
                tokio::time::sleep(config.connect_delay).await;
            }
        }
    }
}
