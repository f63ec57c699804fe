use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::sandbox::Result;
use crate::sandbox::error::IoContext as _;

/// Builds the unit name for a process.
/// Init processes get `<ns>-<id>.service`, exec processes
/// `<ns>-<id>-<exec_id>.service`.
pub fn unit_name(namespace: &str, id: &str, exec_id: Option<&str>) -> String {
    let mut name = format!("{}-{}", escape(namespace), escape(id));
    if let Some(exec_id) = exec_id {
        name.push('-');
        name.push_str(&escape(exec_id));
    }
    name.push_str(".service");
    name
}

// systemd-escape style: anything outside [A-Za-z0-9:_.] becomes \xNN.
// '-' is escaped too since it separates the components of the name.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, b) in s.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b':' || b == b'_' || (b == b'.' && i > 0);
        if keep {
            out.push(b as char);
        } else {
            let _ = write!(out, "\\x{b:02x}");
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceType {
    /// The started command forks and exits, the main process is read from `PIDFile`
    #[default]
    Forking,
    /// The started command is the main process
    Simple,
}

impl ServiceType {
    fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Forking => "forking",
            ServiceType::Simple => "simple",
        }
    }
}

/// Where a standard stream of the unit goes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StdioTarget {
    #[default]
    Null,
    File(PathBuf),
}

impl StdioTarget {
    /// A file target for `path`, or `Null` if the path is empty.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            StdioTarget::Null
        } else {
            StdioTarget::File(path.to_path_buf())
        }
    }

    fn render(&self) -> String {
        match self {
            StdioTarget::Null => "null".to_string(),
            StdioTarget::File(p) => format!("file:{}", p.display()),
        }
    }
}

/// The settings of a generated service unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOptions {
    pub description: String,
    pub service_type: ServiceType,
    pub pid_file: Option<PathBuf>,
    pub exec_start: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub stdin: StdioTarget,
    pub stdout: StdioTarget,
    pub stderr: StdioTarget,
    /// Let any process of the unit talk sd_notify
    pub notify_access_all: bool,
    /// Hand the unit's cgroup subtree over to runc
    pub delegate: bool,
    /// Run the unit in its own mount namespace
    pub private_mounts: bool,
}

impl UnitOptions {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Unit]\n");
        let _ = writeln!(out, "Description={}", self.description);
        out.push_str("DefaultDependencies=no\n");

        out.push_str("\n[Service]\n");
        let _ = writeln!(out, "Type={}", self.service_type.as_str());
        if let Some(pid_file) = &self.pid_file {
            let _ = writeln!(out, "PIDFile={}", pid_file.display());
            out.push_str("GuessMainPID=no\n");
        }
        let exec_start = self
            .exec_start
            .iter()
            .map(|a| quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(out, "ExecStart={exec_start}");
        if let Some(dir) = &self.working_directory {
            let _ = writeln!(out, "WorkingDirectory={}", dir.display());
        }
        let _ = writeln!(out, "StandardInput={}", self.stdin.render());
        let _ = writeln!(out, "StandardOutput={}", self.stdout.render());
        let _ = writeln!(out, "StandardError={}", self.stderr.render());
        if self.notify_access_all {
            out.push_str("NotifyAccess=all\n");
        }
        if self.delegate {
            out.push_str("Delegate=yes\n");
        }
        if self.private_mounts {
            out.push_str("PrivateMounts=yes\n");
        }
        out.push_str("KillMode=mixed\n");
        out.push_str("Restart=no\n");
        out
    }

    /// Writes the unit file `<dir>/<name>`, replacing any previous version.
    pub fn write(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).with_path("error creating unit directory", dir)?;
        let path = dir.join(name);
        std::fs::write(&path, self.render()).with_path("error writing unit", &path)?;
        Ok(path)
    }
}

/// Removes a unit file, ignoring a file that is already gone.
pub fn remove_unit(dir: &Path, name: &str) -> Result<()> {
    let path = dir.join(name);
    match std::fs::remove_file(&path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        res => res.with_path("error removing unit", &path),
    }
}

// Quote one argument of a unit command line.
// `%` and `$` are specifier/variable expansion characters for systemd and
// are doubled so they reach the process literally.
fn quote(arg: &str) -> String {
    let escaped = arg.replace('%', "%%").replace('$', "$$");
    let plain = !escaped.is_empty()
        && escaped
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '"' | '\'' | '\\' | ';'));
    if plain {
        escaped
    } else {
        format!("\"{}\"", escaped.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_names() {
        assert_eq!(unit_name("default", "c1", None), "default-c1.service");
        assert_eq!(unit_name("default", "c1", Some("e1")), "default-c1-e1.service");
        assert_eq!(unit_name("k8s.io", "a-b", None), "k8s.io-a\\x2db.service");
        assert_eq!(unit_name("ns", ".hidden", None), "ns-\\x2ehidden.service");
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("--bundle=/b1"), "--bundle=/b1");
        assert_eq!(quote("a b"), "\"a b\"");
        assert_eq!(quote(""), "\"\"");
        assert_eq!(quote("100%"), "100%%");
        assert_eq!(quote("$HOME"), "$$HOME");
        assert_eq!(quote("say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn test_render() {
        let opts = UnitOptions {
            description: "containerd container default/c1".into(),
            service_type: ServiceType::Forking,
            pid_file: Some("/b1/c1.pid".into()),
            exec_start: vec!["runc".into(), "create".into(), "--bundle=/b1".into(), "c1".into()],
            working_directory: Some("/b1".into()),
            stdin: StdioTarget::Null,
            stdout: StdioTarget::from_path("/fifo/out"),
            stderr: StdioTarget::from_path(""),
            notify_access_all: false,
            delegate: true,
            private_mounts: true,
        };
        let unit = opts.render();
        assert!(unit.starts_with("[Unit]\nDescription=containerd container default/c1\n"));
        assert!(unit.contains("Type=forking\n"));
        assert!(unit.contains("PIDFile=/b1/c1.pid\nGuessMainPID=no\n"));
        assert!(unit.contains("ExecStart=runc create --bundle=/b1 c1\n"));
        assert!(unit.contains("WorkingDirectory=/b1\n"));
        assert!(unit.contains("StandardInput=null\n"));
        assert!(unit.contains("StandardOutput=file:/fifo/out\n"));
        assert!(unit.contains("StandardError=null\n"));
        assert!(unit.contains("Delegate=yes\n"));
        assert!(unit.contains("PrivateMounts=yes\n"));
        assert!(!unit.contains("NotifyAccess"));
    }

    #[test]
    fn test_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let units = dir.path().join("system");
        let opts = UnitOptions {
            exec_start: vec!["true".into()],
            service_type: ServiceType::Simple,
            ..Default::default()
        };
        let path = opts.write(&units, "default-c1.service").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), opts.render());

        remove_unit(&units, "default-c1.service").unwrap();
        assert!(!path.exists());
        remove_unit(&units, "default-c1.service").unwrap();
    }
}
