use super::{Cloud, CloudError, CpiFailure, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct CpiRequest<'a> {
    method: &'a str,
    arguments: Vec<Value>,
    context: CpiContext<'a>,
}

#[derive(Debug, Serialize)]
struct CpiContext<'a> {
    director_uuid: &'a str,
}

#[derive(Debug, Deserialize)]
struct CpiResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<CpiResponseError>,
    #[serde(default)]
    log: String,
}

#[derive(Debug, Deserialize)]
struct CpiResponseError {
    #[serde(rename = "type")]
    class: String,
    message: String,
    #[serde(default)]
    ok_to_retry: bool,
}

/// Runs the installed CPI executable once per call, JSON on stdin and stdout.
///
/// The CPI enforces its own timeouts; calls block for as long as it runs.
#[derive(Debug, Clone)]
pub struct CpiCloud {
    executable: PathBuf,
    director_id: String,
    env: Vec<(String, String)>,
}

impl CpiCloud {
    pub fn new(executable: impl Into<PathBuf>, director_id: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            director_id: director_id.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    async fn call(&self, method: &str, arguments: Vec<Value>) -> Result<Value> {
        let request = CpiRequest {
            method,
            arguments,
            context: CpiContext {
                director_uuid: &self.director_id,
            },
        };
        let payload = serde_json::to_vec(&request).map_err(|source| {
            CloudError::Serialization {
                method: method.to_string(),
                source,
            }
        })?;
        let exec_err = |reason: String| CloudError::Exec {
            method: method.to_string(),
            reason,
        };

        debug!("CPI request: {}", String::from_utf8_lossy(&payload));

        let mut child = tokio::process::Command::new(&self.executable)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| exec_err(format!("starting {:?}: {}", self.executable, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| exec_err(format!("writing request: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| exec_err(format!("waiting for CPI: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(exec_err(format!(
                "exited with {}\nstdout: {}\nstderr: {}",
                output.status, stdout, stderr
            )));
        }

        let response: CpiResponse = serde_json::from_str(&stdout).map_err(|e| {
            exec_err(format!(
                "unmarshaling response: {e}\nstdout: {stdout}\nstderr: {stderr}"
            ))
        })?;
        if !response.log.is_empty() {
            debug!("CPI log for {}: {}", method, response.log);
        }

        match response.error {
            Some(error) => Err(CloudError::Cpi {
                method: method.to_string(),
                failure: CpiFailure {
                    class: error.class,
                    message: error.message,
                    ok_to_retry: error.ok_to_retry,
                },
            }),
            None => Ok(response.result),
        }
    }

    async fn call_for_cid(&self, method: &str, arguments: Vec<Value>) -> Result<String> {
        let result = self.call(method, arguments).await?;
        match result {
            Value::String(cid) => Ok(cid),
            other => Err(CloudError::Exec {
                method: method.to_string(),
                reason: format!("expected a CID string result, got {other}"),
            }),
        }
    }
}

#[async_trait]
impl Cloud for CpiCloud {
    async fn create_stemcell(
        &self,
        image_path: &Path,
        cloud_properties: &Value,
    ) -> Result<String> {
        let cid = self
            .call_for_cid(
                "create_stemcell",
                vec![json!(image_path), cloud_properties.clone()],
            )
            .await?;
        info!("Created stemcell {}", cid);
        Ok(cid)
    }

    async fn delete_stemcell(&self, stemcell_cid: &str) -> Result<()> {
        self.call("delete_stemcell", vec![json!(stemcell_cid)]).await?;
        Ok(())
    }

    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        cloud_properties: &Value,
        networks: &Value,
        disk_cids: &[String],
        env: &Value,
    ) -> Result<String> {
        let cid = self
            .call_for_cid(
                "create_vm",
                vec![
                    json!(agent_id),
                    json!(stemcell_cid),
                    cloud_properties.clone(),
                    networks.clone(),
                    json!(disk_cids),
                    env.clone(),
                ],
            )
            .await?;
        info!("Created VM {}", cid);
        Ok(cid)
    }

    async fn has_vm(&self, vm_cid: &str) -> Result<bool> {
        let result = self.call("has_vm", vec![json!(vm_cid)]).await?;
        result.as_bool().ok_or_else(|| CloudError::Exec {
            method: "has_vm".to_string(),
            reason: format!("expected a boolean result, got {result}"),
        })
    }

    async fn delete_vm(&self, vm_cid: &str) -> Result<()> {
        self.call("delete_vm", vec![json!(vm_cid)]).await?;
        Ok(())
    }

    async fn create_disk(
        &self,
        size_mb: u64,
        cloud_properties: &Value,
        vm_cid: &str,
    ) -> Result<String> {
        self.call_for_cid(
            "create_disk",
            vec![json!(size_mb), cloud_properties.clone(), json!(vm_cid)],
        )
        .await
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<()> {
        self.call("attach_disk", vec![json!(vm_cid), json!(disk_cid)])
            .await?;
        Ok(())
    }

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<()> {
        self.call("detach_disk", vec![json!(vm_cid), json!(disk_cid)])
            .await?;
        Ok(())
    }

    async fn delete_disk(&self, disk_cid: &str) -> Result<()> {
        self.call("delete_disk", vec![json!(disk_cid)]).await?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("cpi");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_sends_request_and_reads_result() {
        let dir = TempDir::new().unwrap();
        let request_file = dir.path().join("request.json");
        let cpi = script(
            &dir,
            &format!(
                "cat > {}\necho '{{\"result\":\"stemcell-cid\",\"error\":null,\"log\":\"\"}}'",
                request_file.display()
            ),
        );

        let cloud = CpiCloud::new(cpi, "director-1");
        let cid = cloud
            .create_stemcell(Path::new("/tmp/image"), &json!({"size": 1}))
            .await
            .unwrap();

        assert_eq!(cid, "stemcell-cid");
        let request: Value =
            serde_json::from_str(&std::fs::read_to_string(request_file).unwrap()).unwrap();
        assert_eq!(request["method"], "create_stemcell");
        assert_eq!(request["arguments"], json!(["/tmp/image", {"size": 1}]));
        assert_eq!(request["context"]["director_uuid"], "director-1");
    }

    #[tokio::test]
    async fn test_error_payload_becomes_cpi_error() {
        let dir = TempDir::new().unwrap();
        let cpi = script(
            &dir,
            "cat > /dev/null\necho '{\"result\":null,\"error\":{\"type\":\"Bosh::Clouds::VMCreationFailed\",\"message\":\"quota exceeded\",\"ok_to_retry\":true},\"log\":\"\"}'",
        );

        let err = CpiCloud::new(cpi, "d")
            .delete_vm("vm-1")
            .await
            .unwrap_err();

        match err {
            CloudError::Cpi { method, failure } => {
                assert_eq!(method, "delete_vm");
                assert_eq!(failure.class, "Bosh::Clouds::VMCreationFailed");
                assert_eq!(failure.message, "quota exceeded");
                assert!(failure.ok_to_retry);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_exec_error() {
        let dir = TempDir::new().unwrap();
        let cpi = script(&dir, "cat > /dev/null\necho boom >&2\nexit 3");

        let err = CpiCloud::new(cpi, "d").has_vm("vm-1").await.unwrap_err();

        assert!(matches!(err, CloudError::Exec { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_env_is_passed_to_cpi() {
        let dir = TempDir::new().unwrap();
        let cpi = script(
            &dir,
            "cat > /dev/null\necho \"{\\\"result\\\":\\\"$JOBS_DIR\\\",\\\"log\\\":\\\"\\\"}\"",
        );

        let cid = CpiCloud::new(cpi, "d")
            .with_env("JOBS_DIR", "/var/jobs")
            .create_disk(1024, &json!({}), "vm-1")
            .await
            .unwrap();

        assert_eq!(cid, "/var/jobs");
    }
}
