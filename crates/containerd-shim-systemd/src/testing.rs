//! Fakes for the capabilities the shim drives: systemd and runc.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::runc::{Runc, Runtime};
use crate::sandbox::{Error, Result};
use crate::systemd::{JOB_DONE, Systemd, UnitState};

/// What the next `start_unit` call does
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The job is queued and finishes with this result
    Job(String),
    /// systemd refuses to queue the job
    Error,
    /// The job is queued and never finishes
    Pending,
}

/// Records every call and answers from canned outcomes.
/// Starts not scripted with [`FakeSystemd::push_start`] finish with `done`.
#[derive(Default)]
pub struct FakeSystemd {
    calls: Mutex<Vec<String>>,
    starts: Mutex<VecDeque<StartOutcome>>,
    pending: Mutex<Vec<oneshot::Sender<String>>>,
    states: Mutex<HashMap<String, UnitState>>,
    fail_reload: AtomicBool,
}

impl FakeSystemd {
    pub fn push_start(&self, outcome: StartOutcome) {
        self.starts.lock().unwrap().push_back(outcome);
    }

    pub fn set_unit_state(&self, name: &str, state: UnitState) {
        self.states.lock().unwrap().insert(name.to_string(), state);
    }

    pub fn fail_reload(&self) {
        self.fail_reload.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Systemd for FakeSystemd {
    async fn reload(&self) -> Result<()> {
        self.record("reload".to_string());
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(Error::Systemd("reload refused".to_string()));
        }
        Ok(())
    }

    async fn start_unit(&self, name: &str, mode: &str) -> Result<oneshot::Receiver<String>> {
        self.record(format!("start {name} {mode}"));
        let outcome = self
            .starts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| StartOutcome::Job(JOB_DONE.to_string()));

        let (tx, rx) = oneshot::channel();
        match outcome {
            StartOutcome::Job(result) => {
                let _ = tx.send(result);
            }
            StartOutcome::Error => {
                return Err(Error::Systemd(format!("unit {name} failed to queue")));
            }
            StartOutcome::Pending => self.pending.lock().unwrap().push(tx),
        }
        Ok(rx)
    }

    async fn kill_unit(&self, name: &str, signal: i32) -> Result<()> {
        self.record(format!("kill {name} {signal}"));
        Ok(())
    }

    async fn reset_failed_unit(&self, name: &str) -> Result<()> {
        self.record(format!("reset-failed {name}"));
        Ok(())
    }

    async fn unit_state(&self, name: &str) -> Result<UnitState> {
        self.record(format!("state {name}"));
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Records runc invocations. They succeed unless told otherwise.
#[derive(Default)]
pub struct FakeRuntime {
    calls: Mutex<Vec<String>>,
    fail_delete: AtomicBool,
}

impl FakeRuntime {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn delete(&self, _runc: &Runc, id: &str, force: bool) -> Result<()> {
        let force = if force { " --force" } else { "" };
        self.calls.lock().unwrap().push(format!("delete{force} {id}"));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Error::Runtime(format!("delete {id} failed: exit status: 1")));
        }
        Ok(())
    }

    async fn start(&self, _runc: &Runc, id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("start {id}"));
        Ok(())
    }
}
