use chrono::{DateTime, Utc};

/// Exit code recorded for a process whose creation failed
pub const FAILED_EXIT_CODE: i32 = 139;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Registered, nothing started yet
    #[default]
    Created,
    /// systemd accepted the unit, the pid is not known yet
    Started,
    Running,
    Stopped,
    Failed,
    /// Removed, runc state purged. Terminal.
    Deleted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Started => "started",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Failed => "failed",
            Status::Deleted => "deleted",
        }
    }

    /// Whether the process is gone for good
    pub fn is_exited(&self) -> bool {
        matches!(self, Status::Stopped | Status::Failed | Status::Deleted)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessState {
    pub exit_code: i32,
    pub exited_at: Option<DateTime<Utc>>,
    pub status: Status,
    /// 0 until the process is known to run
    pub pid: u32,
}

impl ProcessState {
    /// State of a process whose creation failed
    pub fn failed() -> Self {
        Self {
            exit_code: FAILED_EXIT_CODE,
            exited_at: Some(Utc::now()),
            status: Status::Failed,
            pid: 0,
        }
    }
}
