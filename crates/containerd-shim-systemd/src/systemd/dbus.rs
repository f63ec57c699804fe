//! [`Systemd`] over the system bus, talking to `org.freedesktop.systemd1`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use tokio::sync::oneshot;
use zbus::proxy::CacheProperties;
use zbus::zvariant::OwnedObjectPath;
use zbus::{Connection, proxy};

use super::{Systemd, UnitState};
use crate::sandbox::{Error, Result};

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait Manager {
    fn subscribe(&self) -> zbus::Result<()>;

    fn reload(&self) -> zbus::Result<()>;

    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    fn kill_unit(&self, name: &str, whom: &str, signal: i32) -> zbus::Result<()>;

    fn reset_failed_unit(&self, name: &str) -> zbus::Result<()>;

    fn load_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    #[zbus(signal)]
    fn job_removed(
        &self,
        id: u32,
        job: OwnedObjectPath,
        unit: String,
        result: String,
    ) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.freedesktop.systemd1.Unit",
    default_service = "org.freedesktop.systemd1"
)]
trait Unit {
    #[zbus(property)]
    fn active_state(&self) -> zbus::Result<String>;
}

#[proxy(
    interface = "org.freedesktop.systemd1.Service",
    default_service = "org.freedesktop.systemd1"
)]
trait Service {
    #[zbus(property, name = "MainPID")]
    fn main_pid(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn exec_main_status(&self) -> zbus::Result<i32>;

    /// Microseconds since the epoch, 0 while the main process runs
    #[zbus(property)]
    fn exec_main_exit_timestamp(&self) -> zbus::Result<u64>;
}

fn dbus_error(err: zbus::Error) -> Error {
    Error::Systemd(err.to_string())
}

/// A connection to the system instance of systemd
pub struct DbusSystemd {
    conn: Connection,
    manager: ManagerProxy<'static>,
}

impl DbusSystemd {
    pub async fn connect() -> Result<Self> {
        let conn = Connection::system().await.map_err(dbus_error)?;
        Self::with_connection(conn).await
    }

    pub async fn with_connection(conn: Connection) -> Result<Self> {
        let manager = ManagerProxy::new(&conn).await.map_err(dbus_error)?;
        // JobRemoved is only emitted to subscribed clients
        manager.subscribe().await.map_err(dbus_error)?;
        Ok(Self { conn, manager })
    }
}

#[async_trait]
impl Systemd for DbusSystemd {
    async fn reload(&self) -> Result<()> {
        self.manager.reload().await.map_err(dbus_error)
    }

    async fn start_unit(&self, name: &str, mode: &str) -> Result<oneshot::Receiver<String>> {
        // subscribe before queueing the job so its removal can't be missed
        let mut removed = self.manager.receive_job_removed().await.map_err(dbus_error)?;
        let job = self
            .manager
            .start_unit(name, mode)
            .await
            .map_err(dbus_error)?;
        log::debug!("queued start job {} for {name}", job.as_str());

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            while let Some(signal) = removed.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                if args.job() == &job {
                    let _ = tx.send(args.result().clone());
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn kill_unit(&self, name: &str, signal: i32) -> Result<()> {
        self.manager
            .kill_unit(name, "all", signal)
            .await
            .map_err(dbus_error)
    }

    async fn reset_failed_unit(&self, name: &str) -> Result<()> {
        self.manager
            .reset_failed_unit(name)
            .await
            .map_err(dbus_error)
    }

    async fn unit_state(&self, name: &str) -> Result<UnitState> {
        let path = self.manager.load_unit(name).await.map_err(dbus_error)?;

        let unit = UnitProxy::builder(&self.conn)
            .path(path.clone())
            .map_err(dbus_error)?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .map_err(dbus_error)?;
        let service = ServiceProxy::builder(&self.conn)
            .path(path)
            .map_err(dbus_error)?
            .cache_properties(CacheProperties::No)
            .build()
            .await
            .map_err(dbus_error)?;

        let active_state = unit.active_state().await.map_err(dbus_error)?;
        let pid = service.main_pid().await.map_err(dbus_error)?;
        let exit_code = service.exec_main_status().await.map_err(dbus_error)?;
        let exited_at = match service.exec_main_exit_timestamp().await.map_err(dbus_error)? {
            0 => None,
            us => DateTime::<Utc>::from_timestamp_micros(us as i64),
        };

        Ok(UnitState {
            pid,
            exit_code,
            exited_at,
            active_state,
        })
    }
}
