//! Create options as sent by containerd, and their flattened form.
//!
//! containerd forwards the runtime options configured for a container as a
//! protobuf `Any`. Depending on the client this is our own systemd options
//! message, the runc v2 shim options, or the legacy linux runtime options.
//! All of them are decoded once at the boundary into [`CreateOptions`].

use std::path::{Path, PathBuf};

use containerd_shim::api::Options as RuncOptions;
use containerd_shim::protos::protobuf::Message as _;
use containerd_shim::protos::protobuf::well_known_types::any::Any;
use prost::Message;
use serde::Deserialize;

use crate::sandbox::{Error, Result};

pub const SYSTEMD_OPTIONS_TYPE: &str = "containerd.shim.systemd.v1.CreateOptions";
pub const RUNC_OPTIONS_TYPE: &str = "containerd.runc.v1.Options";
pub const LINUX_RUNC_OPTIONS_TYPE: &str = "containerd.linux.runc.CreateOptions";

/// Where the container's stdio goes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum LogMode {
    /// Use the shim-wide default
    Default = 0,
    /// Redirect to the stdio paths supplied by containerd
    Stdio = 1,
    /// Discard all output
    Null = 2,
}

impl LogMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogMode::Default => "default",
            LogMode::Stdio => "stdio",
            LogMode::Null => "null",
        }
    }
}

/// Options specific to this shim
#[derive(Clone, PartialEq, Message)]
pub struct SystemdOptions {
    #[prost(enumeration = "LogMode", tag = "1")]
    pub log_mode: i32,
    #[prost(bool, tag = "2")]
    pub sd_notify_enable: bool,
}

/// `containerd.linux.runc.CreateOptions`, which containerd's shim protos
/// don't ship
#[derive(Clone, PartialEq, Message)]
pub struct LinuxRuncCreateOptions {
    #[prost(bool, tag = "1")]
    pub no_pivot_root: bool,
    #[prost(bool, tag = "2")]
    pub open_tcp: bool,
    #[prost(bool, tag = "3")]
    pub external_unix_sockets: bool,
    #[prost(bool, tag = "4")]
    pub terminal: bool,
    #[prost(bool, tag = "5")]
    pub file_locks: bool,
    #[prost(string, repeated, tag = "6")]
    pub empty_namespaces: Vec<String>,
    #[prost(string, tag = "7")]
    pub cgroups_mode: String,
    #[prost(bool, tag = "8")]
    pub no_new_keyring: bool,
    #[prost(string, tag = "9")]
    pub shim_cgroup: String,
    #[prost(uint32, tag = "10")]
    pub io_uid: u32,
    #[prost(uint32, tag = "11")]
    pub io_gid: u32,
    #[prost(string, tag = "12")]
    pub criu_work_path: String,
    #[prost(string, tag = "13")]
    pub criu_image_path: String,
}

/// The known option payloads, discriminated by their type url
#[derive(Clone, Debug, PartialEq)]
pub enum OptionsSource {
    Systemd(SystemdOptions),
    Runc(RuncOptions),
    LinuxRunc(LinuxRuncCreateOptions),
    Unknown(String),
}

impl OptionsSource {
    /// Decodes an options payload.
    /// Unknown types are not an error, they just don't contribute any option.
    pub fn decode(any: &Any) -> Result<Self> {
        let name = any
            .type_url
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&any.type_url);
        let value = any.value.as_slice();
        let source = match name {
            SYSTEMD_OPTIONS_TYPE => Self::Systemd(SystemdOptions::decode(value).map_err(invalid)?),
            RUNC_OPTIONS_TYPE => Self::Runc(RuncOptions::parse_from_bytes(value).map_err(|err| {
                Error::InvalidArgument(format!("error unmarshalling options: {err}"))
            })?),
            LINUX_RUNC_OPTIONS_TYPE => {
                Self::LinuxRunc(LinuxRuncCreateOptions::decode(value).map_err(invalid)?)
            }
            other => Self::Unknown(other.to_string()),
        };
        Ok(source)
    }
}

fn invalid(err: prost::DecodeError) -> Error {
    Error::InvalidArgument(format!("error unmarshalling options: {err}"))
}

/// Flattened view of every option source
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateOptions {
    pub log_mode: LogMode,
    pub sd_notify_enable: bool,

    pub no_pivot_root: bool,
    pub no_new_keyring: bool,
    pub io_uid: u32,
    pub io_gid: u32,
    pub binary_name: String,
    pub root: PathBuf,
    pub criu_path: String,
    pub systemd_cgroup: bool,
    pub criu_image_path: String,
    pub criu_work_path: String,

    pub external_unix_sockets: bool,
    pub file_locks: bool,
    pub terminal: bool,
    pub empty_namespaces: Vec<String>,
}

impl CreateOptions {
    /// Builds the options for a create request.
    /// `root` and `log_mode` fall back to the shim-wide defaults here so the
    /// rest of the code never has to.
    pub fn from_source(
        source: Option<OptionsSource>,
        default_root: &Path,
        default_log_mode: LogMode,
    ) -> Self {
        let mut opts = Self::default();
        match source {
            Some(OptionsSource::Systemd(o)) => {
                opts.log_mode = LogMode::try_from(o.log_mode).unwrap_or_default();
                opts.sd_notify_enable = o.sd_notify_enable;
            }
            Some(OptionsSource::Runc(o)) => {
                opts.no_pivot_root = o.no_pivot_root;
                opts.no_new_keyring = o.no_new_keyring;
                opts.io_uid = o.io_uid;
                opts.io_gid = o.io_gid;
                opts.binary_name = o.binary_name;
                opts.root = PathBuf::from(o.root);
                opts.criu_path = o.criu_path;
                opts.systemd_cgroup = o.systemd_cgroup;
                opts.criu_image_path = o.criu_image_path;
                opts.criu_work_path = o.criu_work_path;
            }
            Some(OptionsSource::LinuxRunc(o)) => {
                opts.no_pivot_root = o.no_pivot_root;
                opts.no_new_keyring = o.no_new_keyring;
                opts.io_uid = o.io_uid;
                opts.io_gid = o.io_gid;
                opts.criu_image_path = o.criu_image_path;
                opts.criu_work_path = o.criu_work_path;
                opts.external_unix_sockets = o.external_unix_sockets;
                opts.file_locks = o.file_locks;
                opts.terminal = o.terminal;
                opts.empty_namespaces = o.empty_namespaces;
            }
            Some(OptionsSource::Unknown(ty)) => {
                log::debug!("ignoring create options of unknown type {ty}");
            }
            None => {}
        }

        if opts.root.as_os_str().is_empty() {
            opts.root = default_root.to_path_buf();
        }
        if opts.log_mode == LogMode::Default {
            opts.log_mode = default_log_mode;
        }
        opts
    }

    /// Decodes and flattens an optional options payload.
    pub fn decode(
        any: Option<&Any>,
        default_root: &Path,
        default_log_mode: LogMode,
    ) -> Result<Self> {
        let source = match any {
            Some(any) if !any.type_url.is_empty() => {
                log::debug!("decoding create options of type {}", any.type_url);
                Some(OptionsSource::decode(any)?)
            }
            _ => None,
        };
        Ok(Self::from_source(source, default_root, default_log_mode))
    }
}
