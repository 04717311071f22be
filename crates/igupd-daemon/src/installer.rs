use std::time::Duration;

use igupd_core::config::InstallerConfig;
use swupdate_client::{
    ControlConfig, ProgressHandler, SupervisorConfig, SupervisorHandle, SuricattaControl,
};
use tokio_util::sync::CancellationToken;

/// What the orchestrator needs from the installer side.
pub trait Installer: Send + Sync {
    /// Replace the installer command and restart it.
    fn launch(&self, argv: Vec<String>);

    /// Let the current run finish without starting another.
    fn park(&self);

    /// Toggle the installer's server download feature.
    fn set_download_enabled(&self, enable: bool);
}

/// The real installer: a supervised `swupdate` plus its control channel.
pub struct SwupdateInstaller {
    supervisor: SupervisorHandle,
    control: SuricattaControl,
}

impl SwupdateInstaller {
    pub fn spawn(
        config: &InstallerConfig,
        handler: ProgressHandler,
        shutdown: CancellationToken,
    ) -> Self {
        let supervisor = SupervisorHandle::spawn(
            SupervisorConfig {
                progress_socket: config.progress_socket.clone(),
                ..SupervisorConfig::default()
            },
            handler,
            shutdown.clone(),
        );
        let control = SuricattaControl::spawn(
            ControlConfig {
                socket: config.control_socket.clone(),
                ..ControlConfig::default()
            },
            shutdown,
        );
        Self {
            supervisor,
            control,
        }
    }

    /// Wait for supervision to stop once the shutdown token has fired.
    pub async fn join(self) {
        let _ = tokio::time::timeout(Duration::from_secs(10), async {
            self.supervisor.shutdown().await;
            self.control.join().await;
        })
        .await;
    }
}

impl Installer for SwupdateInstaller {
    fn launch(&self, argv: Vec<String>) {
        self.supervisor.launch(argv);
    }

    fn park(&self) {
        self.supervisor.set_command(Vec::new());
    }

    fn set_download_enabled(&self, enable: bool) {
        self.control.set_enabled(enable);
    }
}
