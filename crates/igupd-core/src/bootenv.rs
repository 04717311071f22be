//! Bootloader environment access.
//!
//! The orchestrator only needs opaque get/set on a handful of variables plus
//! reboot and data migration, so [`BootEnv`] is the seam. [`FwEnv`] drives
//! the u-boot `fw_printenv`/`fw_setenv` tools.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{IgupdError, Result};

pub const BOOTSIDE: &str = "bootside";
pub const ALTBOOTCMD: &str = "altbootcmd";
pub const UPGRADE_AVAILABLE: &str = "upgrade_available";
pub const BOOTCOUNT: &str = "bootcount";
pub const BOOTLIMIT: &str = "bootlimit";

const ENV_TOOL_TIMEOUT: Duration = Duration::from_secs(5);
const REBOOT_TIMEOUT: Duration = Duration::from_secs(300);
const MIGRATE_TIMEOUT: Duration = Duration::from_secs(40);

// ---------------------------------------------------------------------------
// BootSlot
// ---------------------------------------------------------------------------

/// One of the two redundant partition sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootSlot {
    A,
    B,
}

impl BootSlot {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "a" => Ok(Self::A),
            "b" => Ok(Self::B),
            other => Err(IgupdError::UnknownBootSide(other.to_string())),
        }
    }

    /// Slot to install into, and to boot after a successful update.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }

    /// Fallback boot command that returns to this slot.
    pub fn alt_boot_cmd(self) -> String {
        format!("setenv bootside {}; saveenv; run bootcmd", self.as_str())
    }

    /// Read the running slot. Anything other than `a` is treated as `b`,
    /// so the next install always targets `a` when the variable is unset.
    pub async fn current(env: &dyn BootEnv) -> Self {
        match env.get_var(BOOTSIDE).await {
            Some(value) => Self::parse(&value).unwrap_or_else(|e| {
                warn!("{e}; assuming side b");
                Self::B
            }),
            None => {
                warn!("{BOOTSIDE} is not set; assuming side b");
                Self::B
            }
        }
    }
}

impl fmt::Display for BootSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// BootEnv
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BootEnv: Send + Sync {
    async fn get_var(&self, name: &str) -> Option<String>;

    async fn set_var(&self, name: &str, value: &str) -> bool;

    async fn reboot(&self) -> bool;

    /// Copy persistent data to the other slot before switching to it.
    async fn migrate_data(&self) -> bool;
}

/// u-boot environment through the `fw_printenv`/`fw_setenv` tools.
#[derive(Debug, Clone)]
pub struct FwEnv {
    printenv: String,
    setenv: String,
    reboot: String,
    migrate_script: PathBuf,
}

impl FwEnv {
    pub fn new(migrate_script: impl Into<PathBuf>) -> Self {
        Self {
            printenv: "fw_printenv".to_string(),
            setenv: "fw_setenv".to_string(),
            reboot: "reboot".to_string(),
            migrate_script: migrate_script.into(),
        }
    }

    /// Override the tool names, for hosts where they live elsewhere.
    pub fn with_tools(
        mut self,
        printenv: impl Into<String>,
        setenv: impl Into<String>,
        reboot: impl Into<String>,
    ) -> Self {
        self.printenv = printenv.into();
        self.setenv = setenv.into();
        self.reboot = reboot.into();
        self
    }
}

#[async_trait]
impl BootEnv for FwEnv {
    async fn get_var(&self, name: &str) -> Option<String> {
        let output = match run(&self.printenv, &[], ENV_TOOL_TIMEOUT).await {
            Ok(out) => out,
            Err(e) => {
                warn!(var = name, "{} failed: {e}", self.printenv);
                return None;
            }
        };
        parse_var(&output.stdout, name)
    }

    async fn set_var(&self, name: &str, value: &str) -> bool {
        debug!(var = name, value, "setting boot environment variable");
        match run(&self.setenv, &[name, value], ENV_TOOL_TIMEOUT).await {
            Ok(out) if out.success => true,
            Ok(out) => {
                warn!(var = name, stderr = %out.stderr.trim(), "{} failed", self.setenv);
                false
            }
            Err(e) => {
                warn!(var = name, "{} failed: {e}", self.setenv);
                false
            }
        }
    }

    async fn reboot(&self) -> bool {
        info!("rebooting");
        match run(&self.reboot, &[], REBOOT_TIMEOUT).await {
            Ok(out) => out.success,
            Err(e) => {
                warn!("reboot failed: {e}");
                false
            }
        }
    }

    async fn migrate_data(&self) -> bool {
        if !self.migrate_script.exists() && which::which(&self.migrate_script).is_err() {
            debug!(script = %self.migrate_script.display(), "no migration script, nothing to migrate");
            return true;
        }
        info!("data migration starting");
        let script = self.migrate_script.to_string_lossy();
        match run(&script, &[], MIGRATE_TIMEOUT).await {
            Ok(out) if out.success && out.stderr.trim().is_empty() => {
                info!("data migration completed");
                true
            }
            Ok(out) => {
                warn!(stderr = %out.stderr.trim(), "data migration failed");
                false
            }
            Err(e) => {
                warn!("data migration failed: {e}");
                false
            }
        }
    }
}

/// Extract `name=value` from `fw_printenv` output. Values are alphanumeric.
fn parse_var(output: &str, name: &str) -> Option<String> {
    let pattern = format!(r"(?m)^{}=([a-zA-Z0-9]*)$", regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| IgupdError::CommandTimeout {
            command: program.to_string(),
            secs: timeout.as_secs(),
        })??;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
