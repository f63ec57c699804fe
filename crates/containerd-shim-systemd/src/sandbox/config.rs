use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::sandbox::error::IoContext as _;
use crate::sandbox::options::LogMode;
use crate::sandbox::{Error, Result};

pub const DEFAULT_ROOT: &str = "/run/containerd-shim-systemd";
pub const DEFAULT_UNIT_DIR: &str = "/run/systemd/system";

/// Shim-wide settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// State directory of the shim. The runc root defaults to `<root>/runc`.
    pub root: PathBuf,
    /// Path or name of the runc binary
    pub runc_binary: PathBuf,
    pub default_log_mode: LogMode,
    /// Do not give each container a private mount namespace
    pub no_new_namespace: bool,
    /// Enables runc debug logs and richer unit start errors
    pub debug: bool,
    /// Where unit files are written
    pub unit_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            runc_binary: PathBuf::from("runc"),
            default_log_mode: LogMode::Stdio,
            no_new_namespace: false,
            debug: false,
            unit_dir: PathBuf::from(DEFAULT_UNIT_DIR),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).with_path("error reading config", path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        toml::from_str(data)
            .map_err(|err| Error::InvalidArgument(format!("error parsing config: {err}")))
    }

    /// Default root for runc state when the create options don't set one
    pub fn runc_root(&self) -> PathBuf {
        self.root.join("runc")
    }
}
