use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

const HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Progress of a local (removable-media) update, as shown on the device
/// indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOutcome {
    Updating,
    Reset,
    Failed,
}

impl DeviceOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Updating => "updating",
            Self::Reset => "reset",
            Self::Failed => "failed",
        }
    }
}

#[async_trait]
pub trait DeviceStatus: Send + Sync {
    async fn notify(&self, outcome: DeviceOutcome);
}

/// Indicator that only logs. Used when no hook is configured.
pub struct LogIndicator;

#[async_trait]
impl DeviceStatus for LogIndicator {
    async fn notify(&self, outcome: DeviceOutcome) {
        info!(outcome = outcome.as_str(), "local update status");
    }
}

/// Runs `<command> <outcome>` for every notification.
pub struct HookIndicator {
    command: String,
}

impl HookIndicator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl DeviceStatus for HookIndicator {
    async fn notify(&self, outcome: DeviceOutcome) {
        let child = Command::new(&self.command)
            .arg(outcome.as_str())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(HOOK_TIMEOUT, child).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => warn!(hook = %self.command, %status, "indicator hook failed"),
            Ok(Err(e)) => warn!(hook = %self.command, "indicator hook failed to start: {e}"),
            Err(_) => warn!(hook = %self.command, "indicator hook timed out"),
        }
    }
}
