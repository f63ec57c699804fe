//! Everything the shim needs from systemd: the unit manager capability and
//! the unit files handed to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::sandbox::Result;

#[cfg(unix)]
pub mod dbus;
pub mod unit;

#[cfg(unix)]
pub use dbus::DbusSystemd;
pub use unit::{UnitOptions, unit_name};

/// Job result systemd reports for a successful start
pub const JOB_DONE: &str = "done";

/// Start mode that replaces any conflicting queued job
pub const MODE_REPLACE: &str = "replace";

/// What systemd knows about a unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitState {
    /// Main PID, 0 when there is none
    pub pid: u32,
    /// Exit status of the main process, once it exited
    pub exit_code: i32,
    pub exited_at: Option<DateTime<Utc>>,
    /// `active`, `activating`, `failed`, `inactive`, ...
    pub active_state: String,
}

impl UnitState {
    pub fn is_exited(&self) -> bool {
        self.exited_at.is_some() && matches!(self.active_state.as_str(), "inactive" | "failed")
    }
}

/// The unit manager.
/// Implementations are shared by every process of the shim.
#[async_trait]
pub trait Systemd: Send + Sync + 'static {
    /// Reloads unit files from disk
    async fn reload(&self) -> Result<()>;

    /// Queues a start job for `name`.
    /// The receiver yields the job result once the job finishes.
    async fn start_unit(&self, name: &str, mode: &str) -> Result<oneshot::Receiver<String>>;

    /// Sends `signal` to every process of the unit
    async fn kill_unit(&self, name: &str, signal: i32) -> Result<()>;

    async fn reset_failed_unit(&self, name: &str) -> Result<()>;

    async fn unit_state(&self, name: &str) -> Result<UnitState>;
}
