use super::{AgentClient, AgentError, AgentState, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    Ping,
    Apply(Value),
    Start,
    Stop,
    GetState,
    MountDisk(String),
    UnmountDisk(String),
    ListDisk,
    MigrateDisk,
}

struct FakeAgentState {
    calls: Vec<AgentCall>,
    failing_pings: u32,
    job_state: String,
    disks: Vec<String>,
    fail_stop: bool,
}

/// In-memory agent that records calls and tracks mounted disks.
pub struct FakeAgentClient {
    state: Mutex<FakeAgentState>,
}

impl Default for FakeAgentClient {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeAgentState {
                calls: Vec::new(),
                failing_pings: 0,
                job_state: "running".to_string(),
                disks: Vec::new(),
                fail_stop: false,
            }),
        }
    }
}

impl FakeAgentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` pings fail.
    pub fn fail_pings(&self, count: u32) {
        self.lock().failing_pings = count;
    }

    pub fn fail_stop(&self) {
        self.lock().fail_stop = true;
    }

    pub fn set_job_state(&self, job_state: impl Into<String>) {
        self.lock().job_state = job_state.into();
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.lock().calls.clone()
    }

    pub fn mounted_disks(&self) -> Vec<String> {
        self.lock().disks.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeAgentState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AgentClient for FakeAgentClient {
    async fn ping(&self) -> Result<String> {
        let mut state = self.lock();
        state.calls.push(AgentCall::Ping);
        if state.failing_pings > 0 {
            state.failing_pings -= 1;
            return Err(AgentError::Request {
                method: "ping".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok("pong".to_string())
    }

    async fn apply(&self, spec: &Value) -> Result<()> {
        self.lock().calls.push(AgentCall::Apply(spec.clone()));
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.lock().calls.push(AgentCall::Start);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(AgentCall::Stop);
        if state.fail_stop {
            return Err(AgentError::Exception {
                method: "stop".to_string(),
                message: "agent unreachable".to_string(),
            });
        }
        Ok(())
    }

    async fn get_state(&self) -> Result<AgentState> {
        let mut state = self.lock();
        state.calls.push(AgentCall::GetState);
        Ok(AgentState {
            job_state: state.job_state.clone(),
        })
    }

    async fn mount_disk(&self, disk_cid: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(AgentCall::MountDisk(disk_cid.to_string()));
        state.disks.push(disk_cid.to_string());
        Ok(())
    }

    async fn unmount_disk(&self, disk_cid: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(AgentCall::UnmountDisk(disk_cid.to_string()));
        state.disks.retain(|d| d != disk_cid);
        Ok(())
    }

    async fn list_disk(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.calls.push(AgentCall::ListDisk);
        Ok(state.disks.clone())
    }

    async fn migrate_disk(&self) -> Result<()> {
        self.lock().calls.push(AgentCall::MigrateDisk);
        Ok(())
    }
}
