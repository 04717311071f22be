//! Single-shot deadline timer with bounded pause/resume.
//!
//! The countdown and the pause sub-timer run as tokio tasks that hold only a
//! weak reference to the timer state, so dropping the [`ResumableTimer`]
//! cancels everything. The callback runs on the timer task; callers that own
//! state elsewhere should make it post a message rather than mutate directly.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Upper bound on the total time a timer may spend paused, measured from the
/// first pause.
pub const MAX_PAUSE: Duration = Duration::from_secs(7200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PauseError {
    #[error("a pause is already active; cancel it with a zero-length pause first")]
    AlreadyPaused,

    #[error("pause would exceed the {}s limit", MAX_PAUSE.as_secs())]
    LimitExceeded,

    #[error("timer is not running")]
    NotRunning,

    #[error("no pause is active")]
    NotPaused,
}

impl PauseError {
    /// Result code reported to RPC callers.
    pub fn code(&self) -> i32 {
        match self {
            Self::AlreadyPaused | Self::NotRunning | Self::NotPaused => -1,
            Self::LimitExceeded => -2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Idle,
    Running,
    Paused,
    Fired,
    Cancelled,
}

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct TimerState {
    timeout: Duration,
    callback: Option<Callback>,
    phase: TimerPhase,
    /// When the running countdown expires.
    deadline: Option<Instant>,
    /// Countdown left when the active pause began.
    left_at_pause: Option<Duration>,
    /// Start of the first pause. Never cleared, so it bounds all later pauses.
    pause_started_at: Option<Instant>,
    countdown: Option<JoinHandle<()>>,
    pause_timer: Option<JoinHandle<()>>,
}

pub struct ResumableTimer {
    inner: Arc<Mutex<TimerState>>,
}

impl ResumableTimer {
    pub fn new(timeout: Duration, callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimerState {
                timeout,
                callback: Some(Box::new(callback)),
                phase: TimerPhase::Idle,
                deadline: None,
                left_at_pause: None,
                pause_started_at: None,
                countdown: None,
                pause_timer: None,
            })),
        }
    }

    /// Begin the countdown. Has no effect unless the timer is idle.
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut st = lock(&self.inner);
        if st.phase != TimerPhase::Idle {
            return;
        }
        st.deadline = Some(Instant::now() + st.timeout);
        st.phase = TimerPhase::Running;
        st.countdown = Some(spawn_countdown(weak, st.timeout));
    }

    /// Stop the countdown for `duration`, after which it resumes on its own.
    ///
    /// Only one pause window can exist. While it is open, a zero-length
    /// request ends it early and any other request is rejected.
    pub fn pause(&self, duration: Duration) -> Result<(), PauseError> {
        let weak = Arc::downgrade(&self.inner);
        let now = Instant::now();
        let mut st = lock(&self.inner);

        if matches!(
            st.phase,
            TimerPhase::Idle | TimerPhase::Fired | TimerPhase::Cancelled
        ) {
            return Err(PauseError::NotRunning);
        }

        let Some(first_pause) = st.pause_started_at else {
            if duration > MAX_PAUSE {
                return Err(PauseError::LimitExceeded);
            }
            if let Some(countdown) = st.countdown.take() {
                countdown.abort();
            }
            st.left_at_pause = Some(left_at(&st, now));
            st.deadline = None;
            st.pause_started_at = Some(now);
            st.phase = TimerPhase::Paused;
            st.pause_timer = Some(spawn_pause(weak, duration));
            return Ok(());
        };

        let elapsed = now.saturating_duration_since(first_pause);
        if elapsed + duration > MAX_PAUSE {
            Err(PauseError::LimitExceeded)
        } else if duration.is_zero() {
            if st.phase != TimerPhase::Paused {
                return Err(PauseError::NotPaused);
            }
            if let Some(pause_timer) = st.pause_timer.take() {
                pause_timer.abort();
            }
            resume_locked(weak, &mut st);
            Ok(())
        } else {
            Err(PauseError::AlreadyPaused)
        }
    }

    /// Restart the countdown with whatever was left when the pause began.
    pub fn resume(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut st = lock(&self.inner);
        if st.phase == TimerPhase::Paused {
            if let Some(pause_timer) = st.pause_timer.take() {
                pause_timer.abort();
            }
            resume_locked(weak, &mut st);
        }
    }

    pub fn cancel(&self) {
        let mut st = lock(&self.inner);
        cancel_locked(&mut st);
    }

    pub fn phase(&self) -> TimerPhase {
        lock(&self.inner).phase
    }

    /// Time the countdown has left, excluding any pause in progress.
    pub fn remaining(&self) -> Duration {
        let st = lock(&self.inner);
        match st.phase {
            TimerPhase::Idle => st.timeout,
            TimerPhase::Running => left_at(&st, Instant::now()),
            TimerPhase::Paused => st.left_at_pause.unwrap_or_default(),
            TimerPhase::Fired | TimerPhase::Cancelled => Duration::ZERO,
        }
    }
}

impl Drop for ResumableTimer {
    fn drop(&mut self) {
        let mut st = lock(&self.inner);
        cancel_locked(&mut st);
    }
}

impl std::fmt::Debug for ResumableTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = lock(&self.inner);
        f.debug_struct("ResumableTimer")
            .field("timeout", &st.timeout)
            .field("phase", &st.phase)
            .finish()
    }
}

fn lock(inner: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
    // A poisoned lock only means a callback panicked elsewhere; the state
    // itself is still consistent.
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

fn left_at(st: &TimerState, now: Instant) -> Duration {
    st.deadline
        .map(|deadline| deadline.saturating_duration_since(now))
        .unwrap_or_default()
}

fn resume_locked(weak: Weak<Mutex<TimerState>>, st: &mut TimerState) {
    let remaining = st.left_at_pause.take().unwrap_or_default();
    st.deadline = Some(Instant::now() + remaining);
    st.pause_timer = None;
    st.phase = TimerPhase::Running;
    st.countdown = Some(spawn_countdown(weak, remaining));
}

fn cancel_locked(st: &mut TimerState) {
    if let Some(countdown) = st.countdown.take() {
        countdown.abort();
    }
    if let Some(pause_timer) = st.pause_timer.take() {
        pause_timer.abort();
    }
    if st.phase != TimerPhase::Fired {
        st.phase = TimerPhase::Cancelled;
    }
    st.callback = None;
}

fn spawn_countdown(weak: Weak<Mutex<TimerState>>, after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let callback = {
            let mut st = lock(&inner);
            if st.phase != TimerPhase::Running {
                return;
            }
            st.phase = TimerPhase::Fired;
            st.countdown = None;
            st.callback.take()
        };
        if let Some(callback) = callback {
            callback();
        }
    })
}

fn spawn_pause(weak: Weak<Mutex<TimerState>>, duration: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut st = lock(&inner);
        if st.phase == TimerPhase::Paused {
            resume_locked(Arc::downgrade(&inner), &mut st);
        }
    })
}
