use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use oci_spec::runtime::Spec;

use super::{Process, ProcessCore, ProcessState, SIGKILL};
use crate::console::{ConsoleAllocator, ConsoleSocket};
use crate::process::ExecProcess;
use crate::sandbox::shim::mount::{Mount, MountConfig};
use crate::sandbox::shim::registry::Registry;
use crate::sandbox::{Context, Error, Result};
use crate::systemd::unit::ServiceType;

/// How the unit invokes runc
struct Invocation {
    args: Vec<String>,
    terminal: bool,
    service_type: ServiceType,
    console: Option<ConsoleSocket>,
}

/// The primary process of a container.
///
/// Its unit runs `runc create` (or `runc restore` when created from a
/// checkpoint), which leaves the container's init waiting for `runc start`.
pub struct InitProcess {
    pub(crate) core: ProcessCore,
    bundle: PathBuf,
    rootfs: Vec<Mount>,
    checkpoint: Option<PathBuf>,
    parent_checkpoint: Option<PathBuf>,
    no_new_namespace: bool,
    pub(crate) execs: Registry<ExecProcess>,
    console: Arc<dyn ConsoleAllocator>,
    deleted: AtomicBool,
}

impl InitProcess {
    pub fn new(
        core: ProcessCore,
        bundle: impl Into<PathBuf>,
        rootfs: Vec<Mount>,
        console: Arc<dyn ConsoleAllocator>,
    ) -> Self {
        Self {
            core,
            bundle: bundle.into(),
            rootfs,
            checkpoint: None,
            parent_checkpoint: None,
            no_new_namespace: false,
            execs: Registry::new(),
            console,
            deleted: AtomicBool::new(false),
        }
    }

    /// Creates the container from a checkpoint image instead of the bundle
    pub fn with_checkpoint(mut self, checkpoint: PathBuf, parent: Option<PathBuf>) -> Self {
        self.checkpoint = Some(checkpoint).filter(|p| !p.as_os_str().is_empty());
        self.parent_checkpoint = parent.filter(|p| !p.as_os_str().is_empty());
        self
    }

    /// Runs the unit in the host mount namespace
    pub fn with_no_new_namespace(mut self, no_new_namespace: bool) -> Self {
        self.no_new_namespace = no_new_namespace;
        self
    }

    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    pub fn no_new_namespace(&self) -> bool {
        self.no_new_namespace
    }

    pub fn is_restore(&self) -> bool {
        self.checkpoint.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn read_pid_file(&self) -> Result<u32> {
        self.core.read_pid_file()
    }

    pub(crate) fn console(&self) -> &Arc<dyn ConsoleAllocator> {
        &self.console
    }

    pub fn exec(&self, exec_id: &str) -> Option<Arc<ExecProcess>> {
        self.execs.get(exec_id)
    }

    /// Creates the container and starts its unit, returning the pid of the
    /// container's init.
    /// On failure runc's state for the container is purged before returning.
    pub async fn create(&self, ctx: &Context) -> Result<u32> {
        let res = self.try_create(ctx).await;
        if res.is_err() {
            if let Err(err) = self
                .core
                .runtime
                .delete(&self.core.runc, &self.core.id, true)
                .await
            {
                log::warn!("error deleting container {} in runc: {err}", self.core.id);
            }
            self.deleted.store(true, Ordering::SeqCst);
            self.core.state.notify();
        }
        res
    }

    async fn try_create(&self, ctx: &Context) -> Result<u32> {
        MountConfig {
            bundle: self.bundle.to_string_lossy().into_owned(),
            rootfs: self.rootfs.clone(),
        }
        .save()?;

        self.core.chown_stdio();

        let invocation = match &self.checkpoint {
            Some(image) => self.restore_invocation(image).await?,
            None => self.create_invocation().await?,
        };
        let console = invocation.console.clone();

        let res = self.run_unit(ctx, invocation).await;
        if res.is_err() {
            if let Some(unit) = console.and_then(|c| c.unit) {
                if let Err(err) = self.core.systemd.kill_unit(&unit, SIGKILL).await {
                    log::warn!("error killing console unit {unit}: {err}");
                }
            }
        }
        res
    }

    async fn run_unit(&self, ctx: &Context, invocation: Invocation) -> Result<u32> {
        let Invocation {
            args,
            terminal,
            service_type,
            ..
        } = invocation;
        let description = format!(
            "containerd container {}/{}",
            self.core.namespace, self.core.id
        );
        let mut unit = self
            .core
            .unit_options(description, service_type, args, terminal);
        unit.private_mounts = !self.no_new_namespace;
        self.core.install_unit(&unit).await?;
        self.core.start_unit(ctx, Some(&self.core.id)).await
    }

    async fn console_socket(&self, terminal: bool) -> Result<Option<ConsoleSocket>> {
        if !terminal {
            return Ok(None);
        }
        let socket = self
            .console
            .allocate(&self.core.namespace, &self.core.id, &self.bundle)
            .await?;
        Ok(Some(socket))
    }

    async fn create_invocation(&self) -> Result<Invocation> {
        let opts = &self.core.opts;
        let terminal = self.core.stdio.terminal || opts.terminal;

        let mut args = vec![
            "create".to_string(),
            format!("--bundle={}", self.bundle.display()),
            format!("--no-pivot={}", opts.no_pivot_root),
            format!("--no-new-keyring={}", opts.no_new_keyring),
            format!("--pid-file={}", self.core.pid_file().display()),
        ];
        let console = self.console_socket(terminal).await?;
        if let Some(socket) = &console {
            args.push(format!("--console-socket={}", socket.path.display()));
        }
        args.push(self.core.id.clone());

        Ok(Invocation {
            args,
            terminal,
            service_type: ServiceType::Forking,
            console,
        })
    }

    async fn restore_invocation(
        &self,
        image: &Path,
    ) -> Result<Invocation> {
        match &self.parent_checkpoint {
            Some(parent) => log::info!(
                "restoring {} from {} on top of {}",
                self.core.id,
                image.display(),
                parent.display()
            ),
            None => log::info!("restoring {} from {}", self.core.id, image.display()),
        }

        let mut opts = self.core.opts.clone();
        if opts.criu_work_path.is_empty() {
            opts.criu_work_path = self
                .core
                .root
                .join("criu-work")
                .to_string_lossy()
                .into_owned();
        }

        // restore requests don't carry the terminal flag, the bundle does
        let spec = Spec::load(self.bundle.join("config.json"))?;
        let terminal = spec
            .process()
            .as_ref()
            .and_then(|p| p.terminal())
            .unwrap_or(false)
            || opts.terminal;

        let mut args = vec![
            "restore".to_string(),
            format!("--image-path={}", image.display()),
            format!("--work-path={}", opts.criu_work_path),
            format!("--bundle={}", self.bundle.display()),
            format!("--no-pivot={}", opts.no_pivot_root),
            "--no-subreaper".to_string(),
        ];

        let console = self.console_socket(terminal).await?;
        let service_type = match &console {
            Some(socket) => {
                args.push("--detach".to_string());
                args.push(format!("--console-socket={}", socket.path.display()));
                opts.external_unix_sockets = true;
                ServiceType::Forking
            }
            None => ServiceType::Simple,
        };
        args.push(format!("--pid-file={}", self.core.pid_file().display()));
        args.extend(self.core.runtime.restore_args(&opts));
        args.push(self.core.id.clone());

        Ok(Invocation {
            args,
            terminal,
            service_type,
            console,
        })
    }
}

#[async_trait]
impl Process for InitProcess {
    fn core(&self) -> &ProcessCore {
        &self.core
    }

    fn container_id(&self) -> &str {
        &self.core.id
    }

    fn exec_id(&self) -> &str {
        ""
    }

    async fn start(&self, _ctx: &Context) -> Result<u32> {
        if self.is_deleted() {
            return Err(Error::FailedPrecondition(format!(
                "container {} is deleted",
                self.core.id
            )));
        }
        let state = self.core.state.get();
        if state.pid == 0 || state.status.is_exited() {
            return Err(Error::FailedPrecondition(format!(
                "container {} is {}",
                self.core.id, state.status
            )));
        }
        // a restored container is already running
        if !self.is_restore() {
            self.core.runtime.start(&self.core.runc, &self.core.id).await?;
        }
        Ok(state.pid)
    }

    async fn delete(&self) -> Result<ProcessState> {
        for (exec_id, exec) in self.execs.list() {
            if let Err(err) = exec.delete().await {
                log::warn!("error deleting exec {exec_id} of {}: {err}", self.core.id);
            }
            self.execs.delete(&exec_id);
        }

        if let Err(err) = self
            .core
            .runtime
            .delete(&self.core.runc, &self.core.id, true)
            .await
        {
            log::warn!("error deleting container {} in runc: {err}", self.core.id);
        }
        self.core.remove_unit().await?;
        self.deleted.store(true, Ordering::SeqCst);
        Ok(self.core.mark_deleted())
    }
}
