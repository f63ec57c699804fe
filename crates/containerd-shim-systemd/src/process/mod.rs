//! Container processes and the systemd units running them.
//!
//! Every process, the container's init process as well as processes exec'd
//! into it, is backed by one unit. The unit runs runc, runc leaves the pid of
//! the actual process in a pid file, and the shim tracks the rest through the
//! unit's state.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::runc::{Runc, Runtime};
use crate::sandbox::error::IoContext as _;
use crate::sandbox::options::{CreateOptions, LogMode};
use crate::sandbox::sync::StateCell;
use crate::sandbox::{Context, Error, Result};
use crate::systemd::unit::{ServiceType, StdioTarget};
use crate::systemd::{JOB_DONE, MODE_REPLACE, Systemd, UnitOptions, UnitState};

mod exec;
mod init;
mod state;

pub use exec::ExecProcess;
pub use init::InitProcess;
pub use state::{FAILED_EXIT_CODE, ProcessState, Status};

#[cfg(unix)]
pub const SIGKILL: i32 = nix::sys::signal::Signal::SIGKILL as i32;
#[cfg(not(unix))]
pub const SIGKILL: i32 = 9;

/// stdio as handed over by containerd, usually fifos
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

impl Stdio {
    fn paths(&self) -> impl Iterator<Item = &str> {
        [&self.stdin, &self.stdout, &self.stderr]
            .into_iter()
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }
}

/// What init and exec processes have in common
pub struct ProcessCore {
    pub(crate) namespace: String,
    pub(crate) id: String,
    pub(crate) unit: String,
    pub(crate) stdio: Stdio,
    /// Directory holding the process files (pid file, exec specs)
    pub(crate) root: PathBuf,
    pub(crate) opts: CreateOptions,
    pub(crate) runc: Runc,
    pub(crate) unit_dir: PathBuf,
    pub(crate) systemd: Arc<dyn Systemd>,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) state: StateCell<ProcessState>,
}

impl ProcessCore {
    pub fn pid_file(&self) -> PathBuf {
        self.root.join(format!("{}.pid", self.id))
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(&self.unit)
    }

    /// Reads the pid runc wrote for this process
    pub fn read_pid_file(&self) -> Result<u32> {
        read_pid_file(&self.pid_file())
    }

    /// Unit settings shared by every process: runc as the command, the
    /// bundle as working directory, stdio according to the log mode.
    pub(crate) fn unit_options(
        &self,
        description: String,
        service_type: ServiceType,
        args: Vec<String>,
        terminal: bool,
    ) -> UnitOptions {
        let (stdin, stdout, stderr) = if terminal || self.opts.log_mode == LogMode::Null {
            // with a terminal all I/O goes through the console socket
            Default::default()
        } else {
            (
                StdioTarget::from_path(&self.stdio.stdin),
                StdioTarget::from_path(&self.stdio.stdout),
                StdioTarget::from_path(&self.stdio.stderr),
            )
        };
        UnitOptions {
            description,
            service_type,
            pid_file: Some(self.pid_file()),
            exec_start: self.runc.command_with(args),
            working_directory: Some(self.root.clone()),
            stdin,
            stdout,
            stderr,
            notify_access_all: self.opts.sd_notify_enable,
            delegate: true,
            private_mounts: false,
        }
    }

    /// Writes the unit file and asks systemd to pick it up
    pub(crate) async fn install_unit(&self, opts: &UnitOptions) -> Result<()> {
        opts.write(&self.unit_dir, &self.unit)?;
        self.reload().await;
        Ok(())
    }

    // A failed reload doesn't mean the unit wasn't picked up, so it never
    // fails the caller.
    async fn reload(&self) {
        if let Err(err) = self.systemd.reload().await {
            log::warn!("error reloading systemd: {err}");
        }
    }

    /// Hands ownership of the stdio paths to the io uid/gid from the options
    #[cfg(unix)]
    pub(crate) fn chown_stdio(&self) {
        use nix::unistd::{Gid, Uid, chown};

        if self.opts.io_uid == 0 && self.opts.io_gid == 0 {
            return;
        }
        let uid = Some(Uid::from_raw(self.opts.io_uid));
        let gid = Some(Gid::from_raw(self.opts.io_gid));
        for path in self.stdio.paths() {
            if let Err(err) = chown(path, uid, gid) {
                log::warn!("error changing owner of {path}: {err}");
            }
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn chown_stdio(&self) {}

    // Opening the stdio paths keeps the fifos from seeing EOF while the
    // unit sets up its own ends.
    fn open_stdio(&self) -> Vec<File> {
        self.stdio
            .paths()
            .filter_map(|p| {
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(p)
                    .ok()
            })
            .collect()
    }

    /// Starts the unit and resolves the pid of the process it runs.
    ///
    /// If systemd refuses the start, the unit's failed state is reset and the
    /// start retried once. `stale` names the runc container purged before
    /// that retry, execs have none: their runc state is the container's.
    pub(crate) async fn start_unit(&self, ctx: &Context, stale: Option<&str>) -> Result<u32> {
        let _stdio = self.open_stdio();
        let name = self.unit.as_str();

        let job = match self.systemd.start_unit(name, MODE_REPLACE).await {
            Ok(job) => job,
            Err(err) => {
                // most likely a failed unit left over from a previous attempt
                log::info!("error starting unit {name}, resetting it: {err}");
                if let Some(id) = stale {
                    if let Err(err) = self.runtime.delete(&self.runc, id, true).await {
                        log::info!("error deleting container {id} in runc: {err}");
                    }
                }
                if let Err(err) = self.systemd.reset_failed_unit(name).await {
                    log::info!("error resetting failed unit {name}: {err}");
                }
                self.systemd
                    .start_unit(name, MODE_REPLACE)
                    .await
                    .map_err(|err| Error::UnitStart(format!("{name}: {err}")))?
            }
        };

        let status = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => {
                if let Err(err) = self.kill(SIGKILL).await {
                    log::warn!("error killing unit {name} after cancellation: {err}");
                }
                return Err(Error::Cancelled);
            }
            status = job => status.unwrap_or_else(|_| "abandoned".to_string()),
        };

        if status != JOB_DONE {
            // A process that exits right away (`sh -c "exit 1"`) fails the
            // start job even though runc did start it. A pid means it ran.
            if let Ok(pid) = self.read_pid_file() {
                if pid > 0 {
                    log::info!("unit {name} finished with {status} after starting pid {pid}");
                    self.set_pid(pid);
                    return Ok(pid);
                }
            }
            return Err(self.start_error(&status));
        }

        self.state.update(|s| {
            if s.status == Status::Created {
                s.status = Status::Started;
            }
        });

        let pid = match self.read_pid_file() {
            Ok(pid) if pid > 0 => pid,
            res => {
                let UnitState { pid, .. } = self.systemd.unit_state(name).await?;
                if pid == 0 {
                    let reason = match res {
                        Ok(_) => "pid file is empty".to_string(),
                        Err(err) => format!("error reading pid file: {err}"),
                    };
                    return Err(Error::UnitStart(format!("{name}: {reason}")));
                }
                pid
            }
        };

        self.set_pid(pid);
        Ok(pid)
    }

    fn start_error(&self, status: &str) -> Error {
        let mut msg = format!("{}: {status}", self.unit);
        if self.runc.debug {
            if let Ok(unit) = std::fs::read_to_string(self.unit_path()) {
                msg.push_str(":\n");
                msg.push_str(&unit);
            }
            if let Some(Ok(log)) = self.runc.log.as_ref().map(std::fs::read_to_string) {
                msg.push('\n');
                msg.push_str(&log);
            }
        }
        Error::UnitStart(msg)
    }

    /// Records `pid` unless a pid is already known, and marks the process running.
    pub(crate) fn set_pid(&self, pid: u32) {
        self.state.update(|s| {
            if s.pid == 0 {
                s.pid = pid;
            }
            if matches!(s.status, Status::Created | Status::Started) {
                s.status = Status::Running;
            }
        });
    }

    /// Records the exit systemd reported for the unit.
    /// Returns the new state, or None if the exit was already recorded.
    pub(crate) fn record_exit(&self, unit: &UnitState) -> Option<ProcessState> {
        self.state.update(|s| {
            if s.status.is_exited() {
                return None;
            }
            s.exit_code = unit.exit_code;
            s.exited_at = Some(unit.exited_at.unwrap_or_else(Utc::now));
            s.status = if s.pid == 0 && unit.exit_code != 0 {
                Status::Failed
            } else {
                Status::Stopped
            };
            Some(s.clone())
        })
    }

    /// Final transition, the process is gone
    pub(crate) fn mark_deleted(&self) -> ProcessState {
        self.state.update(|s| {
            if s.exited_at.is_none() {
                s.exited_at = Some(Utc::now());
            }
            s.status = Status::Deleted;
            s.clone()
        })
    }

    pub(crate) async fn kill(&self, signal: i32) -> Result<()> {
        self.systemd.kill_unit(&self.unit, signal).await
    }

    /// Removes the unit file and any failed state systemd keeps for it.
    pub(crate) async fn remove_unit(&self) -> Result<()> {
        crate::systemd::unit::remove_unit(&self.unit_dir, &self.unit)?;
        if let Err(err) = self.systemd.reset_failed_unit(&self.unit).await {
            log::debug!("error resetting unit {}: {err}", self.unit);
        }
        self.reload().await;
        Ok(())
    }
}

pub fn read_pid_file(path: &Path) -> Result<u32> {
    let data = std::fs::read_to_string(path).with_path("error reading pid file", path)?;
    data.trim()
        .parse()
        .map_err(|err| Error::Internal(format!("error parsing pid file {}: {err}", path.display())))
}

/// A process backed by a unit
#[async_trait]
pub trait Process: Send + Sync + 'static {
    fn core(&self) -> &ProcessCore;

    /// Id of the container the process belongs to
    fn container_id(&self) -> &str;

    /// Exec id, empty for the init process
    fn exec_id(&self) -> &str;

    fn unit_name(&self) -> &str {
        &self.core().unit
    }

    fn state(&self) -> ProcessState {
        self.core().state.get()
    }

    /// Starts the process, returning its pid
    async fn start(&self, ctx: &Context) -> Result<u32>;

    async fn kill(&self, signal: i32) -> Result<()> {
        self.core().kill(signal).await
    }

    /// Purges the process and its unit, returning the final state
    async fn delete(&self) -> Result<ProcessState>;

    /// Waits for the process to exit
    async fn wait(&self) -> ProcessState {
        self.core()
            .state
            .wait_until(|s| s.status.is_exited())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c1.pid");

        assert!(matches!(read_pid_file(&path), Err(Error::Io { .. })));

        std::fs::write(&path, "4242").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), 4242);

        std::fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid_file(&path).unwrap(), 4242);

        std::fs::write(&path, "nope").unwrap();
        assert!(matches!(read_pid_file(&path), Err(Error::Internal(_))));
    }

    #[test]
    fn test_stdio_paths_skip_empty() {
        let stdio = Stdio {
            stdin: String::new(),
            stdout: "/fifo/out".into(),
            stderr: "/fifo/err".into(),
            terminal: false,
        };
        assert_eq!(stdio.paths().collect::<Vec<_>>(), vec!["/fifo/out", "/fifo/err"]);
    }
}
