//! `swupdate-client` — supervision of and IPC with the `swupdate` installer.
//!
//! # Architecture
//!
//! ```text
//! CommandBuilder   ← argv for server (suricatta) or local-image mode
//!     │
//!     ▼
//! SupervisorHandle ← background task: launch → relay progress → wait
//!     │              → back off → relaunch, until cancelled
//!     ▼
//! ProgressRecord   ← decoded from fixed-layout frames (wire.rs),
//!                     delivered to a caller-supplied handler
//!
//! SuricattaControl ← separate task toggling the installer's server
//!                     client over the control socket, coalescing requests
//! ```

pub mod command;
pub mod control;
pub mod error;
pub mod process;
pub mod supervisor;
pub mod wire;

pub use command::{CommandBuilder, ReportResult, ServerArgs};
pub use control::{ControlConfig, SuricattaControl};
pub use error::SwupdateError;
pub use process::{classify_exit, ExitOutcome};
pub use supervisor::{ProgressHandler, SupervisorConfig, SupervisorHandle};
pub use wire::{InstallerStatus, ProgressFrame, ProgressRecord};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, SwupdateError>;
