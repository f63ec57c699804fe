//! The low-level runtime.
//!
//! Units run `runc` directly, so most of the time the shim only needs the
//! command line. The few calls the shim makes itself go through [`Runtime`].

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::sandbox::options::CreateOptions;
use crate::sandbox::{Error, Result};

/// How to invoke runc for one process.
/// Each process gets its own copy, so changing the shim defaults never
/// affects processes that already exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Runc {
    pub command: PathBuf,
    pub root: PathBuf,
    pub debug: bool,
    /// Debug log, only used when `debug` is set
    pub log: Option<PathBuf>,
    pub systemd_cgroup: bool,
    pub criu: Option<PathBuf>,
}

impl Runc {
    /// The runc binary followed by its global flags
    pub fn command_line(&self) -> Vec<String> {
        let mut args = vec![
            self.command.to_string_lossy().into_owned(),
            format!("--root={}", self.root.display()),
        ];
        if self.debug {
            args.push("--debug".to_string());
            if let Some(log) = &self.log {
                args.push(format!("--log={}", log.display()));
            }
        }
        if self.systemd_cgroup {
            args.push("--systemd-cgroup".to_string());
        }
        if let Some(criu) = &self.criu {
            args.push(format!("--criu={}", criu.display()));
        }
        args
    }

    /// The full command line for a runc subcommand
    pub fn command_with(&self, args: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut cmd = self.command_line();
        cmd.extend(args);
        cmd
    }
}

#[async_trait]
pub trait Runtime: Send + Sync + 'static {
    /// Removes runc's state for `id`.
    /// Deleting a container runc doesn't know about is not an error.
    async fn delete(&self, runc: &Runc, id: &str, force: bool) -> Result<()>;

    /// Runs the user process of a container created with `runc create`
    async fn start(&self, runc: &Runc, id: &str) -> Result<()>;

    /// Extra `runc restore` flags derived from the create options
    fn restore_args(&self, opts: &CreateOptions) -> Vec<String> {
        let mut args = vec![];
        if opts.external_unix_sockets {
            args.push("--ext-unix-sk".to_string());
        }
        if opts.terminal {
            args.push("--shell-job".to_string());
        }
        if opts.file_locks {
            args.push("--file-locks".to_string());
        }
        for ns in &opts.empty_namespaces {
            args.push(format!("--empty-ns={ns}"));
        }
        args
    }
}

/// Runs the runc binary
#[derive(Debug, Clone, Copy, Default)]
pub struct RuncCli;

impl RuncCli {
    async fn run(&self, runc: &Runc, args: Vec<String>) -> Result<std::process::Output> {
        let mut cmd = runc.command_with(args);
        let program = cmd.remove(0);

        log::debug!("running {program} {}", cmd.join(" "));
        Command::new(&program)
            .args(&cmd)
            .output()
            .await
            .map_err(|err| Error::Runtime(format!("error running {program}: {err}")))
    }
}

#[async_trait]
impl Runtime for RuncCli {
    async fn delete(&self, runc: &Runc, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["delete".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(id.to_string());

        let output = self.run(runc, args).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_exist(&stderr) {
            return Ok(());
        }
        Err(Error::Runtime(format!(
            "delete {id} failed: {}: {}",
            output.status,
            stderr.trim()
        )))
    }

    async fn start(&self, runc: &Runc, id: &str) -> Result<()> {
        let output = self
            .run(runc, vec!["start".to_string(), id.to_string()])
            .await?;
        if output.status.success() {
            return Ok(());
        }
        Err(Error::Runtime(format!(
            "start {id} failed: {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn is_not_exist(msg: &str) -> bool {
    msg.contains("does not exist") || msg.contains("not found")
}
