use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::{Result, SwupdateError};

// ─── InstallerProcess ─────────────────────────────────────────────────────

/// A running installer subprocess.
///
/// Its stdout and stderr are drained line by line into `tracing` by
/// background tasks so the pipes never fill up.
pub(crate) struct InstallerProcess {
    child: Child,
}

impl InstallerProcess {
    pub(crate) fn spawn(argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or(SwupdateError::NoCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        debug!(pid = child.id(), program = %program, "installer started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }

        Ok(Self { child })
    }

    pub(crate) async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Ask the installer to stop. Used when its command is replaced.
    pub(crate) fn terminate(&self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(pid, "failed to signal installer: {e}");
        }
    }

    /// Kill the subprocess if it is still alive (best-effort).
    pub(crate) async fn kill_if_running(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill().await;
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: R, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "swupdate", stream = name, "{line}");
    }
}

// ─── Exit classification ──────────────────────────────────────────────────

/// How an installer run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    /// Stopped by SIGTERM or SIGKILL; expected when the command is replaced
    /// or the daemon shuts down.
    Stopped(i32),
    /// Any other exit. Signals are reported as the negated signal number.
    Failed(i32),
}

pub fn classify_exit(status: ExitStatus) -> ExitOutcome {
    use std::os::unix::process::ExitStatusExt;

    if let Some(sig) = status.signal() {
        if sig == Signal::SIGTERM as i32 || sig == Signal::SIGKILL as i32 {
            return ExitOutcome::Stopped(sig);
        }
        return ExitOutcome::Failed(-sig);
    }
    match status.code() {
        Some(0) => ExitOutcome::Success,
        Some(code) => ExitOutcome::Failed(code),
        None => ExitOutcome::Failed(-1),
    }
}

pub(crate) fn log_exit(outcome: ExitOutcome) {
    match outcome {
        ExitOutcome::Success => debug!("installer exited"),
        ExitOutcome::Stopped(sig) => info!(signal = sig, "installer stopped by signal"),
        ExitOutcome::Failed(code) => warn!(exit_code = code, "installer command failed"),
    }
}
