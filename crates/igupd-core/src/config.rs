use crate::error::{IgupdError, Result};
use crate::schedule::{
    Schedule, ScheduleStore, DOWNLOAD_SCHEDULE, PRIORITY_UPDATE_SCHEDULE, UPDATE_SCHEDULE,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/igupd.yaml";

/// Where the kernel exposes network interface attributes.
pub const SYSFS_NET_DIR: &str = "/sys/class/net";

// ---------------------------------------------------------------------------
// DaemonConfig
// ---------------------------------------------------------------------------

/// Daemon configuration, read once at startup from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the RPC façade listens on.
    pub listen: String,
    pub device_id_prefix: String,
    pub network_interface: String,
    pub public_key_file: Option<PathBuf>,
    /// Directory holding persisted `<name>.conf` schedule documents.
    pub schedule_dir: PathBuf,
    pub migrate_script: PathBuf,
    pub boot_limit: u32,
    /// Optional command run with `updating`, `reset` or `failed` to drive the
    /// device indicator during local updates.
    pub indicator_hook: Option<String>,
    pub installer: InstallerConfig,
    pub update: UpdateConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7077".to_string(),
            device_id_prefix: "Laird_".to_string(),
            network_interface: "wlan0".to_string(),
            public_key_file: None,
            schedule_dir: PathBuf::from("/data/public/igupd"),
            migrate_script: PathBuf::from("/usr/sbin/migrate_data.sh"),
            boot_limit: 5,
            indicator_hook: None,
            installer: InstallerConfig::default(),
            update: UpdateConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from `path`. A missing file yields the defaults; a present but
    /// malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        match crate::io::read_optional(path)? {
            Some(text) => {
                let config: Self = serde_yaml::from_str(&text)?;
                config.update.check()?;
                debug!(path = %path.display(), "loaded daemon configuration");
                Ok(config)
            }
            None => {
                info!(path = %path.display(), "no configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn schedule_store(&self) -> ScheduleStore {
        ScheduleStore::new(&self.schedule_dir)
    }

    /// The update configuration the daemon runs with after a restart: the
    /// YAML `update` section with any persisted schedules layered on top.
    pub fn startup_update_config(&self) -> UpdateConfig {
        let store = self.schedule_store();
        let mut update = self.update.clone();
        for name in [UPDATE_SCHEDULE, PRIORITY_UPDATE_SCHEDULE, DOWNLOAD_SCHEDULE] {
            if let Some(schedule) = store.load(name) {
                debug!(name, "persisted schedule overrides configuration");
                *update.schedule_mut(name) = Some(schedule);
            }
        }
        update
    }

    /// Device identity reported to the update server: the configured prefix
    /// followed by the MAC address of `network_interface`.
    pub fn device_id(&self, net_dir: &Path) -> Result<String> {
        let path = net_dir.join(&self.network_interface).join("address");
        let mac = std::fs::read_to_string(&path)?;
        Ok(format!("{}{}", self.device_id_prefix, mac.trim()))
    }
}

// ---------------------------------------------------------------------------
// InstallerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub program: String,
    pub progress_socket: PathBuf,
    pub control_socket: PathBuf,
    pub log_level: u8,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            program: "swupdate".to_string(),
            progress_socket: PathBuf::from("/tmp/swupdateprog"),
            control_socket: PathBuf::from("/tmp/sockinstctrl"),
            log_level: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// UpdateConfig
// ---------------------------------------------------------------------------

/// What to install and when. Accepted whole by `SetConfiguration` for local
/// updates; otherwise only the schedule fields are replaced at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Software collection prefix; the target side letter is appended.
    pub select: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blacklist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suricatta: Option<SuricattaConfig>,
    /// Local image path. Present only for removable-media updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_schedule: Option<Schedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_update_schedule: Option<Schedule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_schedule: Option<Schedule>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            select: "stable,main".to_string(),
            blacklist: None,
            suricatta: None,
            image: None,
            update_schedule: None,
            priority_update_schedule: None,
            download_schedule: None,
        }
    }
}

impl UpdateConfig {
    /// Schedule governing reboots: the priority schedule wins when present.
    pub fn reboot_schedule(&self) -> Option<&Schedule> {
        self.priority_update_schedule
            .as_ref()
            .or(self.update_schedule.as_ref())
    }

    pub fn schedule(&self, name: &str) -> Option<&Schedule> {
        match name {
            UPDATE_SCHEDULE => self.update_schedule.as_ref(),
            PRIORITY_UPDATE_SCHEDULE => self.priority_update_schedule.as_ref(),
            DOWNLOAD_SCHEDULE => self.download_schedule.as_ref(),
            _ => None,
        }
    }

    fn schedule_mut(&mut self, name: &str) -> &mut Option<Schedule> {
        match name {
            PRIORITY_UPDATE_SCHEDULE => &mut self.priority_update_schedule,
            DOWNLOAD_SCHEDULE => &mut self.download_schedule,
            _ => &mut self.update_schedule,
        }
    }

    pub fn is_server_mode(&self) -> bool {
        self.suricatta.is_some()
    }

    fn check(&self) -> Result<()> {
        if self.select.trim().is_empty() {
            return Err(IgupdError::InvalidConfig("select must not be empty".into()));
        }
        if let Some(s) = &self.suricatta {
            if s.url.trim().is_empty() {
                return Err(IgupdError::InvalidConfig("suricatta.url must not be empty".into()));
            }
            if s.poll_delay.min > s.poll_delay.max {
                return Err(IgupdError::InvalidConfig(format!(
                    "suricatta.poll_delay.min ({}) exceeds max ({})",
                    s.poll_delay.min, s.poll_delay.max
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuricattaConfig {
    pub url: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default)]
    pub poll_delay: PollDelay,
}

fn default_tenant() -> String {
    "default".to_string()
}

/// Bounds, in seconds, for the randomized server polling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollDelay {
    pub min: u64,
    pub max: u64,
}

impl Default for PollDelay {
    fn default() -> Self {
        Self { min: 60, max: 300 }
    }
}

// ---------------------------------------------------------------------------
// ConfigDocument
// ---------------------------------------------------------------------------

/// Schedule replacements carried by a configuration document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub update_schedule: Option<Schedule>,
    #[serde(default)]
    pub priority_update_schedule: Option<Schedule>,
    #[serde(default)]
    pub download_schedule: Option<Schedule>,
}

impl ScheduleUpdate {
    pub fn is_empty(&self) -> bool {
        self.update_schedule.is_none()
            && self.priority_update_schedule.is_none()
            && self.download_schedule.is_none()
    }

    /// Present schedules paired with their persisted names.
    pub fn named(&self) -> Vec<(&'static str, &Schedule)> {
        [
            (UPDATE_SCHEDULE, self.update_schedule.as_ref()),
            (PRIORITY_UPDATE_SCHEDULE, self.priority_update_schedule.as_ref()),
            (DOWNLOAD_SCHEDULE, self.download_schedule.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, s)| s.map(|s| (name, s)))
        .collect()
    }

    pub fn apply_to(&self, config: &mut UpdateConfig) {
        for (name, schedule) in self.named() {
            *config.schedule_mut(name) = Some(schedule.clone());
        }
    }
}

/// A parsed `SetConfiguration` document.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigDocument {
    /// Full configuration naming a local image: install it now.
    LocalUpdate(UpdateConfig),
    /// One or more schedule replacements.
    Schedules(ScheduleUpdate),
}

impl ConfigDocument {
    /// Parse a JSON document. Fails closed: any invalid schedule, or a
    /// document carrying neither an image nor a schedule, is rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let Some(object) = value.as_object() else {
            return Err(IgupdError::InvalidConfig(
                "configuration must be a JSON object".into(),
            ));
        };

        if object.contains_key("image") {
            let config: UpdateConfig = serde_json::from_value(value)?;
            config.check()?;
            return Ok(Self::LocalUpdate(config));
        }

        let update: ScheduleUpdate = serde_json::from_value(value)?;
        if update.is_empty() {
            return Err(IgupdError::InvalidConfig(
                "configuration names no schedule".into(),
            ));
        }
        Ok(Self::Schedules(update))
    }
}
