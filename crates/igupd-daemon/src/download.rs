use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::orchestrator::Request;

/// Offset added when re-arming at the end of a download window, so the
/// lookup does not land back inside the window that just closed.
pub const REARM_MARGIN: Duration = Duration::from_secs(60);

/// The pair of single-shot timers bounding the next download window.
///
/// Each arming gets a new generation; expiries from an older generation
/// are ignored by the orchestrator even if they were already queued.
#[derive(Default)]
pub(crate) struct DownloadGate {
    generation: u64,
    timers: Vec<JoinHandle<()>>,
}

impl DownloadGate {
    pub(crate) fn cancel(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.generation += 1;
    }

    /// Arm `open` after `start` (skipped when zero) and `close` after `end`.
    pub(crate) fn arm(&mut self, start: Duration, end: Duration, tx: &mpsc::UnboundedSender<Request>) {
        self.cancel();
        if !start.is_zero() {
            self.timers.push(spawn_edge(start, self.generation, true, tx.clone()));
        }
        self.timers.push(spawn_edge(end, self.generation, false, tx.clone()));
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && !self.timers.is_empty()
    }
}

fn spawn_edge(
    after: Duration,
    generation: u64,
    open: bool,
    tx: mpsc::UnboundedSender<Request>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send(Request::DownloadWindow { generation, open });
    })
}
