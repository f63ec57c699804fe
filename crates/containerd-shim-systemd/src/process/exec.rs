use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::{InitProcess, Process, ProcessCore, ProcessState, SIGKILL};
use crate::sandbox::error::IoContext as _;
use crate::sandbox::shim::mount::write_private;
use crate::sandbox::{Context, Error, Result};
use crate::systemd::unit::ServiceType;

/// A process exec'd into a running container with `runc exec`.
pub struct ExecProcess {
    pub(crate) core: ProcessCore,
    /// The OCI process spec as sent by containerd (JSON)
    spec: Vec<u8>,
    parent: Weak<InitProcess>,
    container_id: String,
}

impl ExecProcess {
    /// `core.id` is the exec id
    pub fn new(core: ProcessCore, spec: Vec<u8>, parent: &Arc<InitProcess>) -> Self {
        Self {
            container_id: parent.core.id.clone(),
            parent: Arc::downgrade(parent),
            core,
            spec,
        }
    }

    pub fn process_file(&self) -> PathBuf {
        self.core
            .root
            .join("execs")
            .join(format!("{}-process.json", self.core.id))
    }

    fn parent(&self) -> Result<Arc<InitProcess>> {
        self.parent
            .upgrade()
            .filter(|p| !p.is_deleted())
            .ok_or_else(|| {
                Error::FailedPrecondition(format!("container {} is gone", self.container_id))
            })
    }

    fn terminal(&self) -> bool {
        self.core.stdio.terminal || self.core.opts.terminal
    }

    /// The OCI process runc gets, with the terminal flag matching how the process runs
    fn process_spec(&self) -> Result<Vec<u8>> {
        if !self.terminal() {
            return Ok(self.spec.clone());
        }
        let mut process: oci_spec::runtime::Process = serde_json::from_slice(&self.spec)?;
        process.set_terminal(Some(true));
        Ok(serde_json::to_vec(&process)?)
    }

    /// Persists the process spec and installs the unit. The unit is not started.
    pub async fn create(&self) -> Result<()> {
        let parent = self.parent()?;
        let path = self.process_file();
        if let Some(dir) = path.parent() {
            create_private_dir(dir)?;
        }
        write_private(&path, &self.process_spec()?).with_path("error writing process spec", &path)?;

        self.core.chown_stdio();

        let mut args = vec![
            "exec".to_string(),
            format!("--process={}", path.display()),
            format!("--pid-file={}", self.core.pid_file().display()),
            "--detach".to_string(),
        ];
        if self.terminal() {
            let socket = parent
                .console()
                .allocate(&self.core.namespace, &self.core.id, &self.core.root)
                .await?;
            args.push(format!("--console-socket={}", socket.path.display()));
        }
        args.push(self.container_id.clone());

        let description = format!(
            "containerd exec {}/{}/{}",
            self.core.namespace, self.container_id, self.core.id
        );
        let unit = self
            .core
            .unit_options(description, ServiceType::Forking, args, self.terminal());
        self.core.install_unit(&unit).await
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt as _;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .with_path("error creating directory", dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_path("error creating directory", dir)
}

#[async_trait]
impl Process for ExecProcess {
    fn core(&self) -> &ProcessCore {
        &self.core
    }

    fn container_id(&self) -> &str {
        &self.container_id
    }

    fn exec_id(&self) -> &str {
        &self.core.id
    }

    async fn start(&self, ctx: &Context) -> Result<u32> {
        self.parent()?;
        let state = self.core.state.get();
        if state.status.is_exited() {
            return Err(Error::FailedPrecondition(format!(
                "exec {} is {}",
                self.core.id, state.status
            )));
        }
        self.core.start_unit(ctx, None).await
    }

    async fn delete(&self) -> Result<ProcessState> {
        let state = self.core.state.get();
        if state.pid > 0 && !state.status.is_exited() {
            if let Err(err) = self.core.kill(SIGKILL).await {
                log::warn!("error killing exec {}: {err}", self.core.id);
            }
        }
        self.core.remove_unit().await?;

        let path = self.process_file();
        match std::fs::remove_file(&path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                return Err(err).with_path("error removing process spec", &path);
            }
            _ => {}
        }
        Ok(self.core.mark_deleted())
    }
}
