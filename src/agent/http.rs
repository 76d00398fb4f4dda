use super::{AgentClient, AgentError, AgentState, Result, RetryPolicy};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    method: &'a str,
    arguments: Vec<Value>,
    reply_to: &'a str,
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(default)]
    value: Value,
    #[serde(default)]
    exception: Option<AgentException>,
}

#[derive(Debug, Deserialize)]
struct AgentException {
    message: String,
}

/// Speaks the agent's JSON protocol over HTTPS at `<mbus>/agent`.
///
/// Long-running methods answer with a task handle; those are polled through
/// `get_task` until the agent reports a final value.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: Client,
    endpoint: Url,
    username: String,
    password: Option<String>,
    reply_to: String,
    task_policy: RetryPolicy,
}

impl HttpAgentClient {
    pub fn new(mbus_url: &str, director_id: &str) -> Result<Self> {
        let invalid = |reason: String| AgentError::InvalidUrl {
            url: mbus_url.to_string(),
            reason,
        };
        let mut endpoint = Url::parse(mbus_url).map_err(|e| invalid(e.to_string()))?;
        let username = endpoint.username().to_string();
        let password = endpoint.password().map(str::to_string);
        endpoint
            .set_username("")
            .map_err(|_| invalid("cannot strip credentials".to_string()))?;
        endpoint
            .set_password(None)
            .map_err(|_| invalid("cannot strip credentials".to_string()))?;
        endpoint.set_path("/agent");

        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            username,
            password,
            reply_to: director_id.to_string(),
            task_policy: RetryPolicy::default(),
        })
    }

    pub fn with_task_policy(mut self, policy: RetryPolicy) -> Self {
        self.task_policy = policy;
        self
    }

    async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<Value> {
        let request_err = |reason: String| AgentError::Request {
            method: method.to_string(),
            reason,
        };
        let body = AgentRequest {
            method,
            arguments,
            reply_to: &self.reply_to,
        };
        debug!("Sending agent request {} to {}", method, self.endpoint);

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if !self.username.is_empty() {
            request = request.basic_auth(&self.username, self.password.as_ref());
        }
        let response = request
            .send()
            .await
            .map_err(|e| request_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(request_err(format!("HTTP status {status}")));
        }

        let response: AgentResponse = response.json().await.map_err(|e| AgentError::Response {
            method: method.to_string(),
            reason: e.to_string(),
        })?;

        match response.exception {
            Some(exception) => Err(AgentError::Exception {
                method: method.to_string(),
                message: exception.message,
            }),
            None => Ok(response.value),
        }
    }

    /// Send a method that may run as an agent task and wait for its result.
    async fn send_async(&self, method: &str, arguments: Vec<Value>) -> Result<Value> {
        let mut value = self.send(method, arguments).await?;
        let Some(task_id) = running_task_id(&value) else {
            return Ok(value);
        };

        for _ in 0..self.task_policy.attempts {
            tokio::time::sleep(self.task_policy.delay).await;
            value = self.send("get_task", vec![json!(task_id)]).await?;
            if running_task_id(&value).is_none() {
                return Ok(value);
            }
            debug!("Agent task {} for {} still running", task_id, method);
        }
        Err(AgentError::Timeout {
            attempts: self.task_policy.attempts,
            last_error: format!("task {task_id} for '{method}' still running"),
        })
    }
}

fn running_task_id(value: &Value) -> Option<String> {
    let task_id = value.get("agent_task_id")?.as_str()?;
    match value.get("state").and_then(Value::as_str) {
        Some("running") => Some(task_id.to_string()),
        _ => None,
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn ping(&self) -> Result<String> {
        let value = self.send("ping", vec![]).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn apply(&self, spec: &Value) -> Result<()> {
        self.send_async("apply", vec![spec.clone()]).await?;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.send("start", vec![]).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.send_async("stop", vec![]).await?;
        Ok(())
    }

    async fn get_state(&self) -> Result<AgentState> {
        let value = self.send("get_state", vec![]).await?;
        serde_json::from_value(value).map_err(|e| AgentError::Response {
            method: "get_state".to_string(),
            reason: e.to_string(),
        })
    }

    async fn mount_disk(&self, disk_cid: &str) -> Result<()> {
        self.send_async("mount_disk", vec![json!(disk_cid)]).await?;
        Ok(())
    }

    async fn unmount_disk(&self, disk_cid: &str) -> Result<()> {
        self.send_async("unmount_disk", vec![json!(disk_cid)]).await?;
        Ok(())
    }

    async fn list_disk(&self) -> Result<Vec<String>> {
        let value = self.send("list_disk", vec![]).await?;
        serde_json::from_value(value).map_err(|e| AgentError::Response {
            method: "list_disk".to_string(),
            reason: e.to_string(),
        })
    }

    async fn migrate_disk(&self) -> Result<()> {
        self.send_async("migrate_disk", vec![]).await?;
        Ok(())
    }
}
