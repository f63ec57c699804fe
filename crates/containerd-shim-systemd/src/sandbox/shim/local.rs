use std::path::PathBuf;
use std::sync::Arc;

use containerd_shim::protos::protobuf::MessageField;
use log::debug;
use oci_spec::runtime::Spec;

use crate::console::ConsoleAllocator;
use crate::process::{ExecProcess, InitProcess, Process, ProcessCore, ProcessState, SIGKILL, Stdio};
use crate::runc::{Runc, Runtime};
use crate::sandbox::options::CreateOptions;
use crate::sandbox::shim::events::*;
use crate::sandbox::shim::registry::Registry;
use crate::sandbox::shim::task::*;
use crate::sandbox::sync::StateCell;
use crate::sandbox::utils::ToTimestamp as _;
use crate::sandbox::{Config, Context, Error, Result};
use crate::systemd::{Systemd, unit_name};


/// Local implements the task operations of the shim.
/// Every process is handed to systemd as a unit running runc.
pub struct Local {
    config: Config,
    systemd: Arc<dyn Systemd>,
    runtime: Arc<dyn Runtime>,
    console: Arc<dyn ConsoleAllocator>,
    events: Arc<dyn EventSender>,
    /// Init processes by `<namespace>/<id>`
    pub(super) processes: Registry<InitProcess>,
    /// Every process by unit name
    pub(super) units: Registry<dyn Process>,
}

fn process_key(namespace: &str, id: &str) -> String {
    format!("{namespace}/{id}")
}

impl Local {
    /// Creates a new local task service.
    pub fn new(
        config: Config,
        systemd: Arc<dyn Systemd>,
        runtime: Arc<dyn Runtime>,
        console: Arc<dyn ConsoleAllocator>,
        events: Arc<dyn EventSender>,
    ) -> Self {
        Self {
            config,
            systemd,
            runtime,
            console,
            events,
            processes: Registry::new(),
            units: Registry::new(),
        }
    }

    /// Creates a task service talking to the system instance of systemd
    /// and running the runc binary.
    #[cfg(unix)]
    pub async fn connect(config: Config, events: Arc<dyn EventSender>) -> Result<Self> {
        let systemd = crate::systemd::DbusSystemd::connect().await?;
        Ok(Self::new(
            config,
            Arc::new(systemd),
            Arc::new(crate::runc::RuncCli),
            Arc::new(crate::console::SocketDirConsole),
            events,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn get_init(&self, namespace: &str, id: &str) -> Result<Arc<InitProcess>> {
        self.processes
            .get(&process_key(namespace, id))
            .ok_or_else(|| Error::NotFound(format!("process {id} does not exist")))
    }

    fn get_process(&self, namespace: &str, id: &str, exec_id: &str) -> Result<Arc<dyn Process>> {
        let init = self.get_init(namespace, id)?;
        if exec_id.is_empty() {
            return Ok(init);
        }
        let exec = init
            .exec(exec_id)
            .ok_or_else(|| Error::NotFound(format!("exec {exec_id} does not exist in {id}")))?;
        Ok(exec)
    }

    // `exec_id` is None for the init process
    #[allow(clippy::too_many_arguments)]
    fn process_core(
        &self,
        namespace: &str,
        container_id: &str,
        exec_id: Option<&str>,
        stdio: Stdio,
        root: PathBuf,
        opts: CreateOptions,
        runc: Runc,
    ) -> ProcessCore {
        ProcessCore {
            namespace: namespace.to_string(),
            id: exec_id.unwrap_or(container_id).to_string(),
            unit: unit_name(namespace, container_id, exec_id),
            stdio,
            root,
            opts,
            runc,
            unit_dir: self.config.unit_dir.clone(),
            systemd: self.systemd.clone(),
            runtime: self.runtime.clone(),
            state: StateCell::default(),
        }
    }

    async fn send(&self, namespace: &str, event: Event) {
        self.events.send(namespace, event).await;
    }
}

// The task operations without the transport, errors are tagged by the public wrappers
impl Local {
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    async fn task_create(&self, ctx: &Context, req: CreateTaskRequest) -> Result<CreateTaskResponse> {
        let ns = ctx.namespace_required()?.to_string();
        let key = process_key(&ns, &req.id);
        if self.processes.get(&key).is_some() {
            return Err(Error::AlreadyExists(key));
        }

        let opts = CreateOptions::decode(
            req.options.as_ref(),
            &self.config.runc_root(),
            self.config.default_log_mode,
        )?;

        let bundle = PathBuf::from(&req.bundle);
        let spec = Spec::load(bundle.join("config.json")).map_err(|err| {
            Error::InvalidArgument(format!("could not load runtime spec: {err}"))
        })?;

        // a private mount namespace would keep mounts from propagating back to the host
        let shared = spec
            .linux()
            .as_ref()
            .and_then(|l| l.rootfs_propagation().as_deref())
            == Some("shared");
        let no_new_namespace = self.config.no_new_namespace || shared;

        let runc = Runc {
            command: if opts.binary_name.is_empty() {
                self.config.runc_binary.clone()
            } else {
                PathBuf::from(&opts.binary_name)
            },
            root: opts.root.join(&ns),
            debug: self.config.debug,
            log: self
                .config
                .debug
                .then(|| bundle.join("init-runc-debug.log")),
            systemd_cgroup: opts.systemd_cgroup,
            criu: (!opts.criu_path.is_empty()).then(|| PathBuf::from(&opts.criu_path)),
        };
        let stdio = Stdio {
            stdin: req.stdin.clone(),
            stdout: req.stdout.clone(),
            stderr: req.stderr.clone(),
            terminal: req.terminal,
        };
        let core = self.process_core(&ns, &req.id, None, stdio, bundle.clone(), opts, runc);

        let init = InitProcess::new(core, &bundle, req.rootfs.clone(), self.console.clone())
            .with_checkpoint(
                PathBuf::from(&req.checkpoint),
                Some(PathBuf::from(&req.parent_checkpoint)),
            )
            .with_no_new_namespace(no_new_namespace);
        let init = Arc::new(init);

        self.processes.add(&key, init.clone())?;
        if let Err(err) = self.units.add(init.unit_name(), init.clone()) {
            self.processes.delete(&key);
            return Err(err);
        }

        let pid = match init.create(ctx).await {
            Ok(pid) => pid,
            Err(err) => {
                init.core.state.update(|s| *s = ProcessState::failed());
                self.processes.delete(&key);
                self.units.delete(init.unit_name());
                if let Err(err) = init.delete().await {
                    log::error!("error cleaning up failed process {}: {err}", req.id);
                }
                return Err(err);
            }
        };

        self.send(
            &ns,
            Event::TaskCreate(TaskCreate {
                container_id: req.id,
                bundle: req.bundle,
                rootfs: req.rootfs,
                io: MessageField::some(TaskIO {
                    stdin: req.stdin,
                    stdout: req.stdout,
                    stderr: req.stderr,
                    terminal: req.terminal,
                    ..Default::default()
                }),
                checkpoint: req.checkpoint,
                pid,
                ..Default::default()
            }),
        )
        .await;

        debug!("create done");
        Ok(CreateTaskResponse {
            pid,
            ..Default::default()
        })
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    async fn task_exec(&self, ctx: &Context, req: ExecProcessRequest) -> Result<()> {
        let ns = ctx.namespace_required()?.to_string();
        let init = self.get_init(&ns, &req.id)?;
        let spec = req
            .spec
            .into_option()
            .map(|s| s.value)
            .ok_or_else(|| Error::InvalidArgument("process spec is required".to_string()))?;

        let stdio = Stdio {
            stdin: req.stdin,
            stdout: req.stdout,
            // stdout and stderr share the terminal
            stderr: if req.terminal { String::new() } else { req.stderr },
            terminal: req.terminal,
        };
        let parent = &init.core;
        let runc = Runc {
            log: self
                .config
                .debug
                .then(|| init.bundle().join(format!("{}-runc-debug.log", req.exec_id))),
            ..parent.runc.clone()
        };
        let opts = CreateOptions {
            log_mode: parent.opts.log_mode,
            io_uid: parent.opts.io_uid,
            io_gid: parent.opts.io_gid,
            root: parent.opts.root.clone(),
            systemd_cgroup: parent.opts.systemd_cgroup,
            ..Default::default()
        };
        let core = self.process_core(
            &ns,
            &req.id,
            Some(&req.exec_id),
            stdio,
            parent.root.clone(),
            opts,
            runc,
        );
        let exec = Arc::new(ExecProcess::new(core, spec, &init));

        init.execs.add(&req.exec_id, exec.clone())?;
        if let Err(err) = self.units.add(exec.unit_name(), exec.clone()) {
            init.execs.delete(&req.exec_id);
            return Err(err);
        }

        if let Err(err) = exec.create().await {
            self.units.delete(exec.unit_name());
            init.execs.delete(&req.exec_id);
            return Err(err);
        }

        self.send(
            &ns,
            Event::TaskExecAdded(TaskExecAdded {
                container_id: req.id,
                exec_id: req.exec_id,
                ..Default::default()
            }),
        )
        .await;

        Ok(())
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    async fn task_start(&self, ctx: &Context, req: StartRequest) -> Result<StartResponse> {
        let ns = ctx.namespace_required()?.to_string();
        let p = self.get_process(&ns, &req.id, &req.exec_id)?;
        let pid = p.start(ctx).await?;

        self.send(
            &ns,
            Event::TaskStart(TaskStart {
                container_id: req.id,
                pid,
                ..Default::default()
            }),
        )
        .await;

        Ok(StartResponse {
            pid,
            ..Default::default()
        })
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    async fn task_kill(&self, ctx: &Context, req: KillRequest) -> Result<()> {
        let ns = ctx.namespace_required()?;
        let signal = i32::try_from(req.signal)
            .map_err(|_| Error::InvalidArgument(format!("invalid signal {}", req.signal)))?;
        self.get_process(ns, &req.id, &req.exec_id)?
            .kill(signal)
            .await
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    async fn task_delete(&self, ctx: &Context, req: DeleteRequest) -> Result<DeleteResponse> {
        let ns = ctx.namespace_required()?.to_string();
        let init = self.get_init(&ns, &req.id)?;

        if !req.exec_id.is_empty() {
            let exec = init.exec(&req.exec_id).ok_or_else(|| {
                Error::NotFound(format!("exec {} does not exist in {}", req.exec_id, req.id))
            })?;
            let state = exec.delete().await?;
            init.execs.delete(&req.exec_id);
            self.units.delete(exec.unit_name());
            return Ok(DeleteResponse::from(&state));
        }

        let exec_units: Vec<String> = init
            .execs
            .list()
            .iter()
            .map(|(_, e)| e.unit_name().to_string())
            .collect();

        // the execs are gone from the container whether or not it deletes
        let res = init.delete().await;
        for unit in exec_units {
            self.units.delete(&unit);
        }
        let state = res?;

        self.units.delete(init.unit_name());
        self.processes.delete(&process_key(&ns, &req.id));

        let res = DeleteResponse::from(&state);
        self.send(
            &ns,
            Event::TaskDelete(TaskDelete {
                container_id: req.id.clone(),
                pid: res.pid,
                exit_status: res.exit_status,
                exited_at: res.exited_at.clone(),
                id: req.id,
                ..Default::default()
            }),
        )
        .await;

        Ok(res)
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    async fn task_state(&self, ctx: &Context, req: StateRequest) -> Result<StateResponse> {
        let ns = ctx.namespace_required()?;
        let bundle = self.get_init(ns, &req.id)?.bundle().to_string_lossy().into_owned();
        let p = self.get_process(ns, &req.id, &req.exec_id)?;
        let state = p.state();
        let stdio = &p.core().stdio;

        Ok(StateResponse {
            id: req.id,
            exec_id: req.exec_id,
            bundle,
            pid: state.pid,
            status: state.status,
            stdin: stdio.stdin.clone(),
            stdout: stdio.stdout.clone(),
            stderr: stdio.stderr.clone(),
            terminal: stdio.terminal,
            exit_status: state.exit_code as u32,
            exited_at: state.exited_at.map(|t| t.to_timestamp()),
        })
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    async fn task_wait(&self, ctx: &Context, req: WaitRequest) -> Result<WaitResponse> {
        let ns = ctx.namespace_required()?;
        let p = self.get_process(ns, &req.id, &req.exec_id)?;

        let state = tokio::select! {
            state = p.wait() => state,
            _ = ctx.cancellation().cancelled() => return Err(Error::Cancelled),
        };

        debug!("wait finishes");
        Ok(WaitResponse::from(&state))
    }
}

impl Local {
    /// Creates the container and starts its init process.
    /// Returns once runc reported the pid of the container's init.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn create(&self, ctx: &Context, req: CreateTaskRequest) -> Result<CreateTaskResponse> {
        debug!("create: {:?}", req);
        self.task_create(ctx, req)
            .await
            .map_err(|err| err.in_operation("create"))
    }

    /// Prepares a process to run in an existing container.
    /// The process runs once started with [`Local::start`].
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn exec(&self, ctx: &Context, req: ExecProcessRequest) -> Result<()> {
        debug!("exec: {:?}", req);
        self.task_exec(ctx, req)
            .await
            .map_err(|err| err.in_operation("exec"))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn start(&self, ctx: &Context, req: StartRequest) -> Result<StartResponse> {
        debug!("start: {:?}", req);
        self.task_start(ctx, req)
            .await
            .map_err(|err| err.in_operation("start"))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn kill(&self, ctx: &Context, req: KillRequest) -> Result<()> {
        debug!("kill: {:?}", req);
        self.task_kill(ctx, req)
            .await
            .map_err(|err| err.in_operation("kill"))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn delete(&self, ctx: &Context, req: DeleteRequest) -> Result<DeleteResponse> {
        debug!("delete: {:?}", req);
        self.task_delete(ctx, req)
            .await
            .map_err(|err| err.in_operation("delete"))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn state(&self, ctx: &Context, req: StateRequest) -> Result<StateResponse> {
        debug!("state: {:?}", req);
        self.task_state(ctx, req)
            .await
            .map_err(|err| err.in_operation("state"))
    }

    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn wait(&self, ctx: &Context, req: WaitRequest) -> Result<WaitResponse> {
        debug!("wait: {:?}", req);
        self.task_wait(ctx, req)
            .await
            .map_err(|err| err.in_operation("wait"))
    }

    /// Records the exit of a unit systemd reported as stopped and publishes
    /// a `TaskExit`. Units the shim doesn't know about are ignored.
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn unit_exited(&self, unit: &str) -> Result<()> {
        let Some(p) = self.units.get(unit) else {
            debug!("ignoring exit of unknown unit {unit}");
            return Ok(());
        };
        let unit_state = self.systemd.unit_state(unit).await?;
        if !unit_state.is_exited() {
            debug!("unit {unit} is {}, not recording an exit", unit_state.active_state);
            return Ok(());
        }
        let Some(state) = p.core().record_exit(&unit_state) else {
            return Ok(());
        };

        let container_id = p.container_id().to_string();
        let id = match p.exec_id() {
            "" => container_id.clone(),
            exec_id => exec_id.to_string(),
        };
        log::info!("unit {unit} exited with {}", state.exit_code);
        self.send(
            &p.core().namespace,
            Event::TaskExit(TaskExit {
                container_id,
                id,
                pid: state.pid,
                exit_status: state.exit_code as u32,
                exited_at: state.exited_at.map(|t| t.to_timestamp()).into(),
                ..Default::default()
            }),
        )
        .await;
        Ok(())
    }

    /// Kills and deletes every container, used on shutdown
    #[cfg_attr(feature = "tracing", tracing::instrument(parent = tracing::Span::current(), skip_all, level = "Info"))]
    pub async fn cleanup(&self) {
        for (key, init) in self.processes.list() {
            for (_, exec) in init.execs.list() {
                self.units.delete(exec.unit_name());
            }
            if let Err(err) = init.kill(SIGKILL).await {
                log::warn!("error killing {key}: {err}");
            }
            if let Err(err) = init.delete().await {
                log::warn!("error deleting {key}: {err}");
            }
            self.units.delete(init.unit_name());
            self.processes.delete(&key);
        }

        // units of processes whose container is already gone
        for (unit, p) in self.units.list() {
            if let Err(err) = p.delete().await {
                log::warn!("error deleting unit {unit}: {err}");
            }
            self.units.delete(&unit);
        }
    }
}
