//! Requests and responses of the task operations.
//! Everything but the state snapshot is containerd's task API as is.

pub use containerd_shim::api::{
    CreateTaskRequest, CreateTaskResponse, DeleteRequest, DeleteResponse, ExecProcessRequest,
    KillRequest, StartRequest, StartResponse, StateRequest, WaitRequest, WaitResponse,
};
use containerd_shim::protos::protobuf::well_known_types::timestamp::Timestamp;

use crate::process::{ProcessState, Status};
use crate::sandbox::utils::ToTimestamp as _;

/// State of a process. Unlike containerd's, the status tells a process that
/// failed to start apart from one that stopped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateResponse {
    pub id: String,
    pub exec_id: String,
    pub bundle: String,
    pub pid: u32,
    pub status: Status,
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
    pub exit_status: u32,
    pub exited_at: Option<Timestamp>,
}

impl From<&ProcessState> for WaitResponse {
    fn from(state: &ProcessState) -> Self {
        Self {
            exit_status: state.exit_code as u32,
            exited_at: state.exited_at.map(|t| t.to_timestamp()).into(),
            ..Default::default()
        }
    }
}

impl From<&ProcessState> for DeleteResponse {
    fn from(state: &ProcessState) -> Self {
        Self {
            pid: state.pid,
            exit_status: state.exit_code as u32,
            exited_at: state.exited_at.map(|t| t.to_timestamp()).into(),
            ..Default::default()
        }
    }
}
