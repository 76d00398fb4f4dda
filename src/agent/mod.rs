//! Client for the agent running inside the deployed VM.

pub mod fake;
pub mod http;

pub use fake::{AgentCall, FakeAgentClient};
pub use http::HttpAgentClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid mbus URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Sending '{method}' to agent: {reason}")]
    Request { method: String, reason: String },

    #[error("Agent responded to '{method}' with error: {message}")]
    Exception { method: String, message: String },

    #[error("Unexpected agent response to '{method}': {reason}")]
    Response { method: String, reason: String },

    #[error("Timed out waiting for agent after {attempts} attempts: {last_error}")]
    Timeout { attempts: u32, last_error: String },
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub job_state: String,
}

/// Bounded retry budget for agent polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 300,
            delay: Duration::from_millis(500),
        }
    }
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn ping(&self) -> Result<String>;

    async fn apply(&self, spec: &Value) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn get_state(&self) -> Result<AgentState>;

    async fn mount_disk(&self, disk_cid: &str) -> Result<()>;

    async fn unmount_disk(&self, disk_cid: &str) -> Result<()>;

    async fn list_disk(&self) -> Result<Vec<String>>;

    async fn migrate_disk(&self) -> Result<()>;

    /// Ping until the agent answers or the budget is spent.
    async fn wait_until_ready(&self, policy: RetryPolicy) -> Result<()> {
        let mut last_error = String::from("no attempts made");
        for attempt in 1..=policy.attempts {
            match self.ping().await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!("Agent ping attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                }
            }
            if attempt < policy.attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }
        Err(AgentError::Timeout {
            attempts: policy.attempts,
            last_error,
        })
    }

    /// Poll `get_state` until the jobs report `running`.
    async fn wait_until_running(&self, policy: RetryPolicy) -> Result<()> {
        let mut last_error = String::from("no attempts made");
        for attempt in 1..=policy.attempts {
            match self.get_state().await {
                Ok(state) if state.job_state == "running" => return Ok(()),
                Ok(state) => last_error = format!("job state is '{}'", state.job_state),
                Err(e) => last_error = e.to_string(),
            }
            debug!("Agent not running yet (attempt {}): {}", attempt, last_error);
            if attempt < policy.attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }
        Err(AgentError::Timeout {
            attempts: policy.attempts,
            last_error,
        })
    }
}
