use std::path::{Path, PathBuf};

use containerd_shim::api::CreateTaskRequest;
use containerd_shim::protos::protobuf::Message as _;
pub use containerd_shim::protos::types::mount::Mount;

use crate::sandbox::Result;
use crate::sandbox::error::IoContext as _;

pub const MOUNT_CONFIG_FILE: &str = "mounts.pb";

/// The rootfs mounts of a container, kept in its bundle so they can be found
/// again after a restart. Stored as a `CreateTaskRequest` carrying only the
/// bundle and the mounts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MountConfig {
    pub bundle: String,
    pub rootfs: Vec<Mount>,
}

impl MountConfig {
    pub fn path(bundle: impl AsRef<Path>) -> PathBuf {
        bundle.as_ref().join(MOUNT_CONFIG_FILE)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path(&self.bundle);
        let req = CreateTaskRequest {
            bundle: self.bundle.clone(),
            rootfs: self.rootfs.clone(),
            ..Default::default()
        };
        write_private(&path, &req.write_to_bytes()?).with_path("error writing mount config", &path)
    }

    pub fn load(bundle: impl AsRef<Path>) -> Result<Self> {
        let path = Self::path(bundle);
        let data = std::fs::read(&path).with_path("error reading mount config", &path)?;
        let req = CreateTaskRequest::parse_from_bytes(&data)?;
        Ok(Self {
            bundle: req.bundle,
            rootfs: req.rootfs,
        })
    }
}

/// Writes `data` to `path` with 0600 permissions.
pub(crate) fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write as _;
    #[cfg(unix)]
    use std::os::unix::fs::OpenOptionsExt as _;

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);
    opts.open(path)?.write_all(data)
}
