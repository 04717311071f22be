//! Update orchestration state machine.
//!
//! A single task owns every piece of update state. RPC calls, installer
//! progress and timer expiries all reach it as [`Request`]s on one mailbox,
//! so they are applied strictly in arrival order.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use igupd_core::bootenv::{
    BootEnv, BootSlot, ALTBOOTCMD, BOOTCOUNT, BOOTLIMIT, BOOTSIDE, UPGRADE_AVAILABLE,
};
use igupd_core::config::{ConfigDocument, DaemonConfig, UpdateConfig};
use igupd_core::schedule::next_window;
use igupd_core::timer::{ResumableTimer, TimerPhase};
use igupd_core::{IgupdError, Result};
use swupdate_client::{
    CommandBuilder, InstallerStatus, ProgressHandler, ProgressRecord, ReportResult, ServerArgs,
};

use crate::device::{DeviceOutcome, DeviceStatus};
use crate::download::{DownloadGate, REARM_MARGIN};
use crate::installer::Installer;

/// Both must be installed in one run before the boot side is switched.
pub const KERNEL_IMAGE: &str = "kernel.itb";
pub const ROOTFS_IMAGE: &str = "rootfs.bin";

/// Local wall-clock time source.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Local::now().naive_local())
}

// ---------------------------------------------------------------------------
// Codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Ready,
    UpdatesAvailable,
    InProgress,
    /// No usable update source was configured.
    Aborted,
}

impl UpdateState {
    pub fn code(self) -> i32 {
        match self {
            Self::Ready => 0,
            Self::UpdatesAvailable => 1,
            Self::InProgress => 2,
            Self::Aborted => -1,
        }
    }
}

/// Payload of the `UpdatePending` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePending {
    Failed,
    Snoozed,
    Downloading,
    Scheduled,
    Reboot,
}

impl UpdatePending {
    pub fn code(self) -> i32 {
        match self {
            Self::Failed => -1,
            Self::Snoozed => 0,
            Self::Downloading => 1,
            Self::Scheduled => 2,
            Self::Reboot => 3,
        }
    }
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub state: i32,
    pub boot_side: String,
    pub switch_boot_side: bool,
    /// Seconds of countdown left on a scheduled reboot, pauses excluded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reboot_in_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

pub(crate) enum Request {
    SetConfiguration {
        document: String,
        reply: oneshot::Sender<i32>,
    },
    CheckUpdate {
        perform: bool,
        reply: oneshot::Sender<i32>,
    },
    Snooze {
        seconds: i64,
        reply: oneshot::Sender<i32>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Progress(ProgressRecord),
    RebootDue {
        generation: u64,
    },
    DownloadWindow {
        generation: u64,
        open: bool,
    },
}

/// Cloneable client of the orchestrator task.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<UpdatePending>,
}

/// Receiving side, consumed by [`Orchestrator::spawn`].
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<Request>,
    tx: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<UpdatePending>,
}

/// Create the mailbox first so the installer's progress handler can be
/// wired before the orchestrator exists.
pub fn channel() -> (OrchestratorHandle, Mailbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(64);
    let handle = OrchestratorHandle {
        tx: tx.clone(),
        events: events.clone(),
    };
    (handle, Mailbox { rx, tx, events })
}

impl OrchestratorHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| IgupdError::OrchestratorStopped)?;
        rx.await.map_err(|_| IgupdError::OrchestratorStopped)
    }

    /// `0` if the document was accepted, `-1` otherwise.
    pub async fn set_configuration(&self, document: impl Into<String>) -> Result<i32> {
        let document = document.into();
        self.call(|reply| Request::SetConfiguration { document, reply })
            .await
    }

    /// Returns the update state code after the call.
    pub async fn check_update(&self, perform: bool) -> Result<i32> {
        self.call(|reply| Request::CheckUpdate { perform, reply })
            .await
    }

    pub async fn snooze(&self, seconds: i64) -> Result<i32> {
        self.call(|reply| Request::Snooze { seconds, reply }).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        self.call(|reply| Request::Status { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdatePending> {
        self.events.subscribe()
    }

    /// Handler that forwards installer progress into the mailbox.
    pub fn progress_handler(&self) -> ProgressHandler {
        let tx = self.tx.clone();
        Arc::new(move |record| {
            let _ = tx.send(Request::Progress(record));
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Collaborators {
    pub boot_env: Arc<dyn BootEnv>,
    pub installer: Arc<dyn Installer>,
    pub device: Arc<dyn DeviceStatus>,
    pub clock: Clock,
}

pub struct Orchestrator {
    config: DaemonConfig,
    device_id: String,
    env: Arc<dyn BootEnv>,
    installer: Arc<dyn Installer>,
    device: Arc<dyn DeviceStatus>,
    clock: Clock,
    tx: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<UpdatePending>,

    update: UpdateConfig,
    boot_side: BootSlot,
    state: UpdateState,
    updated_components: BTreeSet<String>,
    switch_boot_side: bool,
    local_update: bool,
    reboot_timer: Option<ResumableTimer>,
    reboot_generation: u64,
    download: DownloadGate,
}

impl Orchestrator {
    /// Start the orchestrator task. It verifies the previous boot, launches
    /// the installer and then serves requests until `shutdown` fires.
    pub fn spawn(
        config: DaemonConfig,
        device_id: String,
        collaborators: Collaborators,
        mailbox: Mailbox,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let Mailbox { rx, tx, events } = mailbox;
        let update = config.startup_update_config();
        let orchestrator = Self {
            config,
            device_id,
            env: collaborators.boot_env,
            installer: collaborators.installer,
            device: collaborators.device,
            clock: collaborators.clock,
            tx,
            events,
            update,
            boot_side: BootSlot::B,
            state: UpdateState::Ready,
            updated_components: BTreeSet::new(),
            switch_boot_side: false,
            local_update: false,
            reboot_timer: None,
            reboot_generation: 0,
            download: DownloadGate::default(),
        };
        tokio::spawn(orchestrator.run(rx, shutdown))
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Request>, shutdown: CancellationToken) {
        self.startup().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }
        self.download.cancel();
        self.reboot_timer = None;
        debug!("update orchestrator stopped");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::SetConfiguration { document, reply } => {
                let _ = reply.send(self.set_configuration(&document));
            }
            Request::CheckUpdate { perform, reply } => {
                let _ = reply.send(self.check_update(perform));
            }
            Request::Snooze { seconds, reply } => {
                let _ = reply.send(self.snooze(seconds));
            }
            Request::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Request::Progress(record) => self.on_progress(record).await,
            Request::RebootDue { generation } => {
                if generation == self.reboot_generation && self.reboot_timer.is_some() {
                    self.reboot().await;
                } else {
                    debug!(generation, "ignoring superseded reboot timer");
                }
            }
            Request::DownloadWindow { generation, open } => {
                if !self.download.is_current(generation) {
                    debug!(generation, "ignoring superseded download window edge");
                } else if open {
                    info!("download window opened");
                    self.installer.set_download_enabled(true);
                } else {
                    info!("download window closed");
                    self.arm_download(REARM_MARGIN);
                }
            }
        }
    }

    // ── Startup ────────────────────────────────────────────────────────────

    async fn startup(&mut self) {
        self.boot_side = BootSlot::current(self.env.as_ref()).await;
        info!(boot_side = %self.boot_side, device_id = %self.device_id, "update orchestrator starting");
        let report = self.verify_boot().await;
        self.start_installer(report);
        self.arm_download(Duration::ZERO);
    }

    /// After an upgrade reboot, decide whether the new side came up and clear
    /// the rollback counters. `None` if the last boot was not an upgrade.
    async fn verify_boot(&self) -> Option<ReportResult> {
        if self.env.get_var(UPGRADE_AVAILABLE).await.as_deref() != Some("1") {
            return None;
        }
        let boot_count = self
            .env
            .get_var(BOOTCOUNT)
            .await
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let result = if boot_count > self.config.boot_limit {
            warn!(boot_count, "upgraded side failed to boot, running fallback");
            ReportResult::Failed
        } else {
            info!(boot_count, "upgraded side booted");
            ReportResult::Success
        };
        self.env.set_var(UPGRADE_AVAILABLE, "0").await;
        self.env.set_var(BOOTCOUNT, "0").await;
        Some(result)
    }

    // ── Installer ──────────────────────────────────────────────────────────

    /// Launch the installer for the current configuration. Server mode takes
    /// precedence over a local image; with neither the state becomes
    /// `Aborted` and nothing runs.
    fn start_installer(&mut self, report: Option<ReportResult>) -> bool {
        let installer_cfg = &self.config.installer;
        let builder = CommandBuilder::new(
            &installer_cfg.program,
            format!("{}-{}", self.update.select, self.boot_side.other()),
        )
        .log_level(installer_cfg.log_level)
        .blacklist(self.update.blacklist.clone())
        .public_key(self.config.public_key_file.clone());

        let argv = if let Some(server) = &self.update.suricatta {
            let args = ServerArgs {
                url: server.url.clone(),
                tenant: server.tenant.clone(),
                device_id: self.device_id.clone(),
                poll_min: server.poll_delay.min,
                poll_max: server.poll_delay.max,
                report,
            };
            info!(report = ?report, "starting installer in server mode");
            self.local_update = false;
            builder.server(&args, &mut rand::thread_rng())
        } else if let Some(image) = &self.update.image {
            info!(image = %image, "starting installer for local image");
            self.local_update = true;
            builder.local(image)
        } else {
            warn!("{}", IgupdError::NoUpdateSource);
            self.state = UpdateState::Aborted;
            self.installer.park();
            return false;
        };

        if self.state == UpdateState::Aborted {
            self.state = UpdateState::Ready;
        }
        self.installer.launch(argv);
        true
    }

    async fn on_progress(&mut self, record: ProgressRecord) {
        let names_image = record.image.is_some();
        if let Some(image) = record.image {
            self.updated_components.insert(image);
        }

        match record.status {
            InstallerStatus::Start => {
                if self.local_update {
                    self.device.notify(DeviceOutcome::Updating).await;
                }
                self.emit(UpdatePending::Downloading);
                self.state = UpdateState::InProgress;
            }
            // Per-image success; the run ends with the image-less record.
            InstallerStatus::Success if names_image => {
                debug!(components = ?self.updated_components, "component installed");
            }
            InstallerStatus::Success => {
                if self.updated_components.is_empty() {
                    info!("installer skipped the update");
                    self.settle();
                    if self.local_update {
                        self.finish_local(DeviceOutcome::Reset).await;
                    } else if self.update.is_server_mode() {
                        self.start_installer(Some(ReportResult::Success));
                    }
                    return;
                }

                info!(components = ?self.updated_components, "update installed");
                if self.updated_components.contains(KERNEL_IMAGE)
                    && self.updated_components.contains(ROOTFS_IMAGE)
                {
                    self.switch_boot_side = true;
                }
                if self.local_update {
                    self.installer.park();
                }
                self.schedule_reboot();
                self.state = UpdateState::UpdatesAvailable;
                self.updated_components.clear();
            }
            InstallerStatus::Failure => {
                warn!(info = %record.info, "update failed");
                self.settle();
                self.updated_components.clear();
                if self.local_update {
                    self.finish_local(DeviceOutcome::Failed).await;
                }
            }
            InstallerStatus::BadCommand => {
                self.updated_components.clear();
                if self.local_update {
                    self.finish_local(DeviceOutcome::Failed).await;
                }
            }
            _ => {}
        }
    }

    /// Leave the in-progress state after a run that installed nothing. A
    /// reboot still pending from an earlier run keeps the update available.
    fn settle(&mut self) {
        let reboot_pending = self.reboot_timer.as_ref().is_some_and(|timer| {
            matches!(timer.phase(), TimerPhase::Running | TimerPhase::Paused)
        });
        self.state = if reboot_pending {
            UpdateState::UpdatesAvailable
        } else {
            UpdateState::Ready
        };
    }

    /// Wrap up a removable-media update and return to normal operation.
    async fn finish_local(&mut self, outcome: DeviceOutcome) {
        self.device.notify(outcome).await;
        self.local_update = false;
        self.update = self.config.startup_update_config();
        self.arm_download(Duration::ZERO);
        self.start_installer(None);
    }

    // ── Reboot ─────────────────────────────────────────────────────────────

    /// Arm the reboot timer for the next reboot window, superseding any
    /// earlier one.
    fn schedule_reboot(&mut self) {
        let window = next_window((self.clock)(), self.update.reboot_schedule());
        self.reboot_generation += 1;
        let generation = self.reboot_generation;
        let tx = self.tx.clone();
        let timer = ResumableTimer::new(window.start, move || {
            let _ = tx.send(Request::RebootDue { generation });
        });
        timer.start();
        self.reboot_timer = Some(timer);
        info!(delay_secs = window.start.as_secs(), "reboot scheduled");
        self.emit(UpdatePending::Scheduled);
    }

    async fn reboot(&mut self) {
        let mut migrated = true;
        if self.switch_boot_side {
            migrated = self.env.migrate_data().await;
            if migrated {
                let target = self.boot_side.other();
                self.env.set_var(BOOTSIDE, target.as_str()).await;
                self.env
                    .set_var(ALTBOOTCMD, &self.boot_side.alt_boot_cmd())
                    .await;
                info!(from = %self.boot_side, to = %target, "boot side switched");
            }
        }

        if migrated {
            self.emit(UpdatePending::Reboot);
            self.env.set_var(UPGRADE_AVAILABLE, "1").await;
            self.env
                .set_var(BOOTLIMIT, &self.config.boot_limit.to_string())
                .await;
            if !self.env.reboot().await {
                error!("reboot command failed");
            }
            return;
        }

        error!("data migration failed, reboot aborted");
        self.switch_boot_side = false;
        self.state = UpdateState::Ready;
        self.emit(UpdatePending::Failed);
        self.updated_components.clear();
        self.reboot_timer = None;
        if self.local_update {
            self.finish_local(DeviceOutcome::Failed).await;
        } else if self.update.is_server_mode() {
            self.start_installer(Some(ReportResult::Failed));
        }
    }

    // ── RPC ────────────────────────────────────────────────────────────────

    fn set_configuration(&mut self, document: &str) -> i32 {
        let parsed = match ConfigDocument::parse(document) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("configuration rejected: {e}");
                return -1;
            }
        };

        match parsed {
            ConfigDocument::LocalUpdate(config) => {
                info!("local update configuration received");
                self.update = config;
                self.arm_download(Duration::ZERO);
                self.start_installer(None);
            }
            ConfigDocument::Schedules(schedules) => {
                let named = schedules.named();
                let names: Vec<&str> = named.iter().map(|(name, _)| *name).collect();
                if let Err(e) = self.config.schedule_store().save_all(&named) {
                    error!(?names, "failed to persist schedules: {e}");
                    return -1;
                }
                schedules.apply_to(&mut self.update);
                info!(?names, "schedules updated");
                if schedules.download_schedule.is_some() {
                    self.arm_download(Duration::ZERO);
                }
            }
        }
        0
    }

    fn check_update(&mut self, perform: bool) -> i32 {
        if perform && matches!(self.state, UpdateState::Ready | UpdateState::Aborted) {
            self.start_installer(None);
        }
        self.state.code()
    }

    fn snooze(&mut self, seconds: i64) -> i32 {
        let Ok(seconds) = u64::try_from(seconds) else {
            return -1;
        };
        let Some(timer) = &self.reboot_timer else {
            debug!("no reboot scheduled, nothing to snooze");
            return -1;
        };
        match timer.pause(Duration::from_secs(seconds)) {
            Ok(()) => {
                info!(seconds, "reboot snoozed");
                self.emit(UpdatePending::Snoozed);
                0
            }
            Err(e) => {
                info!(seconds, "snooze rejected: {e}");
                e.code()
            }
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state.code(),
            boot_side: self.boot_side.as_str().to_string(),
            switch_boot_side: self.switch_boot_side,
            reboot_in_secs: self.reboot_timer.as_ref().map(|t| t.remaining().as_secs()),
        }
    }

    // ── Download window ────────────────────────────────────────────────────

    /// Re-evaluate the download window as seen from `now + margin` and arm
    /// its edges. Only applies in server mode.
    fn arm_download(&mut self, margin: Duration) {
        self.download.cancel();
        if !self.update.is_server_mode() {
            return;
        }

        let offset = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        let window = next_window((self.clock)() + offset, self.update.download_schedule.as_ref());
        if window.is_always_open() {
            debug!("download always permitted");
            self.installer.set_download_enabled(true);
            return;
        }

        let start = margin + window.start;
        let end = margin + window.end;
        self.installer.set_download_enabled(start.is_zero());
        debug!(
            start_secs = start.as_secs(),
            end_secs = end.as_secs(),
            "download window armed"
        );
        self.download.arm(start, end, &self.tx);
    }

    fn emit(&self, pending: UpdatePending) {
        debug!(code = pending.code(), "update pending: {pending:?}");
        let _ = self.events.send(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use swupdate_client::ProgressFrame;
    use tempfile::TempDir;
    use tokio::time::sleep;

    // ── Fakes ──────────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeEnv {
        vars: Mutex<HashMap<String, String>>,
        reboots: AtomicUsize,
        migration_fails: AtomicBool,
    }

    impl FakeEnv {
        fn with(vars: &[(&str, &str)]) -> Arc<Self> {
            let env = Self::default();
            for (k, v) in vars {
                env.vars.lock().unwrap().insert(k.to_string(), v.to_string());
            }
            Arc::new(env)
        }

        fn var(&self, name: &str) -> Option<String> {
            self.vars.lock().unwrap().get(name).cloned()
        }
    }

    #[async_trait::async_trait]
    impl BootEnv for FakeEnv {
        async fn get_var(&self, name: &str) -> Option<String> {
            self.var(name)
        }
        async fn set_var(&self, name: &str, value: &str) -> bool {
            self.vars.lock().unwrap().insert(name.into(), value.into());
            true
        }
        async fn reboot(&self) -> bool {
            self.reboots.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn migrate_data(&self) -> bool {
            !self.migration_fails.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct FakeInstaller {
        launches: Mutex<Vec<Vec<String>>>,
        downloads: Mutex<Vec<bool>>,
        parked: AtomicUsize,
    }

    impl FakeInstaller {
        fn launches(&self) -> Vec<Vec<String>> {
            self.launches.lock().unwrap().clone()
        }
        fn last_launch(&self) -> Vec<String> {
            self.launches().last().cloned().unwrap_or_default()
        }
        fn downloads(&self) -> Vec<bool> {
            self.downloads.lock().unwrap().clone()
        }
    }

    impl Installer for FakeInstaller {
        fn launch(&self, argv: Vec<String>) {
            self.launches.lock().unwrap().push(argv);
        }
        fn park(&self) {
            self.parked.fetch_add(1, Ordering::SeqCst);
        }
        fn set_download_enabled(&self, enable: bool) {
            self.downloads.lock().unwrap().push(enable);
        }
    }

    #[derive(Default)]
    struct FakeDevice(Mutex<Vec<DeviceOutcome>>);

    #[async_trait::async_trait]
    impl DeviceStatus for FakeDevice {
        async fn notify(&self, outcome: DeviceOutcome) {
            self.0.lock().unwrap().push(outcome);
        }
    }

    struct Harness {
        handle: OrchestratorHandle,
        env: Arc<FakeEnv>,
        installer: Arc<FakeInstaller>,
        device: Arc<FakeDevice>,
        events: broadcast::Receiver<UpdatePending>,
        dir: TempDir,
        _shutdown: tokio_util::sync::DropGuard,
    }

    impl Harness {
        fn progress(&self, status: InstallerStatus, image: Option<&str>) {
            (self.handle.progress_handler())(ProgressRecord {
                status,
                image: image.map(str::to_string),
                info: String::new(),
                exit_code: None,
            });
        }

        fn drain_events(&mut self) -> Vec<UpdatePending> {
            let mut seen = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                seen.push(e);
            }
            seen
        }
    }

    // 2024-01-01 is a Monday; 2023-12-31 a Sunday.
    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    /// Wall clock that advances with tokio's (paused) clock.
    fn clock_from(base: NaiveDateTime) -> Clock {
        let origin = tokio::time::Instant::now();
        Arc::new(move || base + chrono::Duration::from_std(origin.elapsed()).unwrap())
    }

    fn server_update(extra: &str) -> String {
        format!(
            r#"update:
  suricatta:
    url: https://hawkbit.example.com
    poll_delay: {{ min: 30, max: 30 }}
{extra}"#
        )
    }

    async fn start(yaml: &str, now: NaiveDateTime, env: Arc<FakeEnv>) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config: DaemonConfig = serde_yaml::from_str(yaml).unwrap();
        config.schedule_dir = dir.path().join("schedules");
        config.migrate_script = dir.path().join("migrate.sh");

        let installer = Arc::new(FakeInstaller::default());
        let device = Arc::new(FakeDevice::default());
        let (handle, mailbox) = channel();
        let events = handle.subscribe();
        let shutdown = CancellationToken::new();
        Orchestrator::spawn(
            config,
            "Laird_c0:ee:40:00:00:01".into(),
            Collaborators {
                boot_env: env.clone(),
                installer: installer.clone(),
                device: device.clone(),
                clock: clock_from(now),
            },
            mailbox,
            shutdown.clone(),
        );
        // Startup has finished once the first request is answered.
        handle.status().await.unwrap();
        Harness {
            handle,
            env,
            installer,
            device,
            events,
            dir,
            _shutdown: shutdown.drop_guard(),
        }
    }

    // ── Tests ──────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn full_update_switches_side_and_schedules_reboot() {
        let yaml = server_update("  update_schedule:\n    - \"1\": \"9-17\"\n");
        let env = FakeEnv::with(&[(BOOTSIDE, "a")]);
        let mut h = start(&yaml, at(2023, 12, 31, 20), env).await;

        let argv = h.installer.last_launch();
        assert!(argv.contains(&"stable,main-b".to_string()), "{argv:?}");

        // The installer reports each image with its own success record.
        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Success, Some(ROOTFS_IMAGE));
        h.progress(InstallerStatus::Success, Some(KERNEL_IMAGE));
        h.progress(InstallerStatus::Success, None);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, UpdateState::UpdatesAvailable.code());
        assert!(status.switch_boot_side);
        assert_eq!(h.installer.launches().len(), 1, "no result report relaunch");
        // Sunday 20:00 → Monday 09:00.
        assert_eq!(status.reboot_in_secs, Some(13 * 3600));
        assert_eq!(
            h.drain_events(),
            vec![UpdatePending::Downloading, UpdatePending::Scheduled]
        );

        sleep(Duration::from_secs(13 * 3600 + 1)).await;
        h.handle.status().await.unwrap();
        assert_eq!(h.env.reboots.load(Ordering::SeqCst), 1);
        assert_eq!(h.env.var(BOOTSIDE).as_deref(), Some("b"));
        assert_eq!(
            h.env.var(ALTBOOTCMD).as_deref(),
            Some("setenv bootside a; saveenv; run bootcmd")
        );
        assert_eq!(h.env.var(UPGRADE_AVAILABLE).as_deref(), Some("1"));
        assert_eq!(h.env.var(BOOTLIMIT).as_deref(), Some("5"));
        assert_eq!(h.drain_events(), vec![UpdatePending::Reboot]);
    }

    #[tokio::test(start_paused = true)]
    async fn image_success_does_not_end_the_run() {
        let yaml = server_update("  update_schedule:\n    - \"1\": \"9-17\"\n");
        let mut h = start(&yaml, at(2023, 12, 31, 20), FakeEnv::with(&[])).await;

        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Success, Some(ROOTFS_IMAGE));
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, UpdateState::InProgress.code());
        assert_eq!(status.reboot_in_secs, None);
        assert_eq!(h.drain_events(), vec![UpdatePending::Downloading]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_run_keeps_pending_reboot_available() {
        let yaml = server_update("  update_schedule:\n    - \"1\": \"9-17\"\n");
        let mut h = start(&yaml, at(2023, 12, 31, 20), FakeEnv::with(&[])).await;

        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Success, Some(KERNEL_IMAGE));
        h.progress(InstallerStatus::Success, None);
        h.handle.status().await.unwrap();
        h.drain_events();

        // The next poll finds nothing new.
        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Success, None);
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, UpdateState::UpdatesAvailable.code());
        assert_eq!(status.reboot_in_secs, Some(13 * 3600));

        // A failed poll does not hide the pending reboot either.
        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Failure, None);
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, UpdateState::UpdatesAvailable.code());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_update_reboots_without_switching() {
        let yaml = server_update("");
        let env = FakeEnv::with(&[(BOOTSIDE, "a")]);
        let h = start(&yaml, at(2024, 1, 1, 10), env).await;

        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Success, Some("app.tar"));
        h.progress(InstallerStatus::Success, None);
        h.handle.status().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        h.handle.status().await.unwrap();

        assert_eq!(h.env.reboots.load(Ordering::SeqCst), 1);
        assert_eq!(h.env.var(BOOTSIDE).as_deref(), Some("a"));
        assert_eq!(h.env.var(ALTBOOTCMD), None);
    }

    #[tokio::test(start_paused = true)]
    async fn snooze_delays_reboot_and_caps_total_pause() {
        let yaml = server_update("  update_schedule:\n    - \"1\": \"9-17\"\n");
        let env = FakeEnv::with(&[(BOOTSIDE, "b")]);
        let mut h = start(&yaml, at(2023, 12, 31, 20), env).await;

        assert_eq!(h.handle.snooze(100).await.unwrap(), -1, "nothing to snooze yet");

        h.progress(InstallerStatus::Success, Some(ROOTFS_IMAGE));
        h.progress(InstallerStatus::Success, None);
        h.handle.status().await.unwrap();
        h.drain_events();

        assert_eq!(h.handle.snooze(-5).await.unwrap(), -1);
        assert_eq!(h.handle.snooze(3600).await.unwrap(), 0);
        assert_eq!(h.drain_events(), vec![UpdatePending::Snoozed]);
        assert_eq!(h.handle.snooze(60).await.unwrap(), -1);
        assert_eq!(h.handle.snooze(7201).await.unwrap(), -2);
        assert!(h.drain_events().is_empty());

        sleep(Duration::from_secs(13 * 3600 + 3599)).await;
        h.handle.status().await.unwrap();
        assert_eq!(h.env.reboots.load(Ordering::SeqCst), 0);
        sleep(Duration::from_secs(2)).await;
        h.handle.status().await.unwrap();
        assert_eq!(h.env.reboots.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_snooze_after_pause_expired_is_refused() {
        let yaml = server_update("  update_schedule:\n    - \"1\": \"9-17\"\n");
        let mut h = start(&yaml, at(2023, 12, 31, 20), FakeEnv::with(&[])).await;

        h.progress(InstallerStatus::Success, Some(ROOTFS_IMAGE));
        h.progress(InstallerStatus::Success, None);
        h.handle.status().await.unwrap();
        h.drain_events();

        assert_eq!(h.handle.snooze(600).await.unwrap(), 0);
        sleep(Duration::from_secs(601)).await;
        assert_eq!(h.handle.snooze(0).await.unwrap(), -1);
        assert_eq!(h.drain_events(), vec![UpdatePending::Snoozed]);

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.reboot_in_secs, Some(13 * 3600 - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_migration_aborts_reboot_and_reports_failure() {
        let yaml = server_update("");
        let env = FakeEnv::with(&[(BOOTSIDE, "a")]);
        env.migration_fails.store(true, Ordering::SeqCst);
        let mut h = start(&yaml, at(2024, 1, 1, 10), env).await;

        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Run, Some(KERNEL_IMAGE));
        h.progress(InstallerStatus::Run, Some(ROOTFS_IMAGE));
        h.progress(InstallerStatus::Success, None);
        h.handle.status().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, UpdateState::Ready.code());
        assert!(!status.switch_boot_side);
        assert_eq!(status.reboot_in_secs, None);
        assert_eq!(h.env.reboots.load(Ordering::SeqCst), 0);
        assert_eq!(h.env.var(BOOTSIDE).as_deref(), Some("a"));
        assert_eq!(
            h.drain_events(),
            vec![
                UpdatePending::Downloading,
                UpdatePending::Scheduled,
                UpdatePending::Failed
            ]
        );
        let argv = h.installer.last_launch();
        assert!(argv.iter().any(|a| a.contains(" -c 3 ")), "{argv:?}");
        assert_eq!(h.handle.snooze(10).await.unwrap(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_update_reports_success_to_server() {
        let h = start(&server_update(""), at(2024, 1, 1, 10), FakeEnv::with(&[])).await;
        assert_eq!(h.installer.launches().len(), 1);

        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Success, None);
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, UpdateState::Ready.code());

        let launches = h.installer.launches();
        assert_eq!(launches.len(), 2);
        assert!(launches[1].iter().any(|a| a.contains(" -c 2 ")));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_and_bad_command_return_to_ready() {
        let h = start(&server_update(""), at(2024, 1, 1, 10), FakeEnv::with(&[])).await;
        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Run, Some(KERNEL_IMAGE));
        assert_eq!(h.handle.check_update(false).await.unwrap(), 2);
        h.progress(InstallerStatus::Failure, None);
        assert_eq!(h.handle.check_update(false).await.unwrap(), 0);

        // Components from a failed run do not leak into the next one.
        h.progress(InstallerStatus::Run, Some(ROOTFS_IMAGE));
        (h.handle.progress_handler())(ProgressRecord::bad_command(1));
        h.progress(InstallerStatus::Run, Some(KERNEL_IMAGE));
        h.progress(InstallerStatus::Success, None);
        let status = h.handle.status().await.unwrap();
        assert!(!status.switch_boot_side);
        assert!(h.device.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn boot_verification_reports_failed_upgrade() {
        let env = FakeEnv::with(&[(UPGRADE_AVAILABLE, "1"), (BOOTCOUNT, "6")]);
        let h = start(&server_update(""), at(2024, 1, 1, 10), env).await;
        let argv = h.installer.last_launch();
        assert!(argv.iter().any(|a| a.contains(" -c 3 ")), "{argv:?}");
        assert_eq!(h.env.var(UPGRADE_AVAILABLE).as_deref(), Some("0"));
        assert_eq!(h.env.var(BOOTCOUNT).as_deref(), Some("0"));
    }

    #[tokio::test(start_paused = true)]
    async fn boot_verification_reports_successful_upgrade() {
        let env = FakeEnv::with(&[(UPGRADE_AVAILABLE, "1"), (BOOTCOUNT, "2")]);
        let h = start(&server_update(""), at(2024, 1, 1, 10), env).await;
        let argv = h.installer.last_launch();
        assert!(argv.iter().any(|a| a.contains(" -c 2 ")), "{argv:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn no_update_source_aborts() {
        let h = start("{}", at(2024, 1, 1, 10), FakeEnv::with(&[])).await;
        assert!(h.installer.launches().is_empty());
        assert_eq!(h.handle.check_update(true).await.unwrap(), -1);
        assert!(h.installer.parked.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn check_update_with_perform_relaunches() {
        let h = start(&server_update(""), at(2024, 1, 1, 10), FakeEnv::with(&[])).await;
        assert_eq!(h.handle.check_update(true).await.unwrap(), 0);
        assert_eq!(h.installer.launches().len(), 2);

        h.progress(InstallerStatus::Start, None);
        assert_eq!(h.handle.check_update(true).await.unwrap(), 2);
        assert_eq!(h.installer.launches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn local_update_drives_indicator_and_returns_to_server_mode() {
        let env = FakeEnv::with(&[(BOOTSIDE, "b")]);
        let h = start(&server_update(""), at(2024, 1, 1, 10), env).await;

        let doc = r#"{"image": "/media/usb/update.swu"}"#;
        assert_eq!(h.handle.set_configuration(doc).await.unwrap(), 0);
        let argv = h.installer.last_launch();
        assert_eq!(
            argv,
            vec![
                "swupdate",
                "-e",
                "stable,main-a",
                "-l",
                "5",
                "-i",
                "/media/usb/update.swu"
            ]
        );

        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Failure, None);
        h.handle.status().await.unwrap();

        assert_eq!(
            *h.device.0.lock().unwrap(),
            vec![DeviceOutcome::Updating, DeviceOutcome::Failed]
        );
        let argv = h.installer.last_launch();
        assert_eq!(argv[5], "-u", "{argv:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn local_update_success_parks_installer() {
        let h = start("{}", at(2024, 1, 1, 10), FakeEnv::with(&[])).await;
        let doc = r#"{"image": "/media/usb/update.swu"}"#;
        assert_eq!(h.handle.set_configuration(doc).await.unwrap(), 0);
        let parked_before = h.installer.parked.load(Ordering::SeqCst);

        h.progress(InstallerStatus::Start, None);
        h.progress(InstallerStatus::Success, Some("app.tar"));
        h.progress(InstallerStatus::Success, None);
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.state, UpdateState::UpdatesAvailable.code());
        assert_eq!(h.installer.parked.load(Ordering::SeqCst), parked_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_documents_are_validated_and_persisted() {
        let h = start(&server_update(""), at(2024, 1, 1, 10), FakeEnv::with(&[])).await;

        assert_eq!(h.handle.set_configuration("not json").await.unwrap(), -1);
        assert_eq!(
            h.handle
                .set_configuration(r#"{"update_schedule": [{"8": "1-2"}]}"#)
                .await
                .unwrap(),
            -1
        );
        assert_eq!(
            h.handle
                .set_configuration(r#"{"update_schedule": [{"2": "3-4"}]}"#)
                .await
                .unwrap(),
            0
        );
        let saved = h.dir.path().join("schedules/update_schedule.conf");
        let text = std::fs::read_to_string(saved).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc, serde_json::json!({"update_schedule": [{"2": "3-4"}]}));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_schedule_save_keeps_nothing() {
        let h = start(&server_update(""), at(2024, 1, 1, 10), FakeEnv::with(&[])).await;
        let schedules = h.dir.path().join("schedules");
        std::fs::create_dir_all(schedules.join("download_schedule.conf")).unwrap();
        let downloads = h.installer.downloads();

        let doc = r#"{"update_schedule": [{"2": "3-4"}], "download_schedule": [{"*": "1-3"}]}"#;
        assert_eq!(h.handle.set_configuration(doc).await.unwrap(), -1);

        assert!(!schedules.join("update_schedule.conf").exists());
        assert_eq!(h.installer.downloads(), downloads, "download gate untouched");
    }

    #[tokio::test(start_paused = true)]
    async fn download_window_toggles_feature() {
        let yaml = server_update("  download_schedule:\n    - \"1\": \"12-13\"\n");
        let h = start(&yaml, at(2024, 1, 1, 10), FakeEnv::with(&[])).await;
        assert_eq!(h.installer.downloads(), vec![false]);

        sleep(Duration::from_secs(2 * 3600 + 1)).await;
        h.handle.status().await.unwrap();
        assert_eq!(h.installer.downloads(), vec![false, true]);

        sleep(Duration::from_secs(2 * 3600)).await;
        h.handle.status().await.unwrap();
        assert_eq!(h.installer.downloads(), vec![false, true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn download_schedule_change_rearms() {
        let yaml = server_update("  download_schedule:\n    - \"1\": \"12-13\"\n");
        let h = start(&yaml, at(2024, 1, 1, 10), FakeEnv::with(&[])).await;
        let doc = r#"{"download_schedule": [{"*": "0-23"}]}"#;
        assert_eq!(h.handle.set_configuration(doc).await.unwrap(), 0);
        assert_eq!(h.installer.downloads(), vec![false, true]);

        // The old 12:00 edge never fires.
        sleep(Duration::from_secs(5 * 3600)).await;
        h.handle.status().await.unwrap();
        assert_eq!(h.installer.downloads(), vec![false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn local_mode_never_touches_download_control() {
        let h = start("{}", at(2024, 1, 1, 10), FakeEnv::with(&[])).await;
        let doc = r#"{"image": "/media/usb/update.swu", "download_schedule": [{"1": "12-13"}]}"#;
        assert_eq!(h.handle.set_configuration(doc).await.unwrap(), 0);
        assert!(h.installer.downloads().is_empty());
    }

    #[test]
    fn decoded_frame_feeds_orchestrator_record() {
        let frame = ProgressFrame {
            status: InstallerStatus::Success.code(),
            image: KERNEL_IMAGE.into(),
            ..Default::default()
        };
        let record = frame.record();
        assert_eq!(record.status, InstallerStatus::Success);
        assert_eq!(record.image.as_deref(), Some(KERNEL_IMAGE));
    }
}
