use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::sandbox::Result;
use crate::sandbox::error::IoContext as _;

/// The rendezvous point runc hands a terminal master to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSocket {
    pub path: PathBuf,
    /// Unit serving the socket, if the allocator started one.
    /// It is killed if the process it was allocated for fails to start.
    pub unit: Option<String>,
}

#[async_trait]
pub trait ConsoleAllocator: Send + Sync + 'static {
    /// Prepares a console socket for process `id` whose files live in `root`
    async fn allocate(&self, namespace: &str, id: &str, root: &Path) -> Result<ConsoleSocket>;
}

/// Places console sockets next to the process files.
/// Whoever copies the terminal I/O listens on the returned path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketDirConsole;

#[async_trait]
impl ConsoleAllocator for SocketDirConsole {
    async fn allocate(&self, _namespace: &str, id: &str, root: &Path) -> Result<ConsoleSocket> {
        std::fs::create_dir_all(root).with_path("error creating console directory", root)?;
        let path = root.join(format!("{id}.console.sock"));
        // a stale socket from a previous attempt would make the listener fail
        match std::fs::remove_file(&path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                return Err(err).with_path("error removing stale console socket", &path);
            }
            _ => {}
        }
        Ok(ConsoleSocket { path, unit: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_dir_console() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c1.console.sock"), b"").unwrap();

        let socket = SocketDirConsole
            .allocate("default", "c1", dir.path())
            .await
            .unwrap();
        assert_eq!(socket.path, dir.path().join("c1.console.sock"));
        assert!(socket.unit.is_none());
        assert!(!socket.path.exists());
    }
}
