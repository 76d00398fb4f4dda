use crate::agent::{AgentClient, AgentError, RetryPolicy};
use crate::cloud::{Cloud, CloudError};
use crate::config::{ConfigError, DeploymentStateService};
use crate::manifest::DeploymentManifest;
use crate::stemcell::CloudStemcell;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM operation failed: {0}")]
    Cloud(#[from] CloudError),

    #[error("Communicating with agent: {0}")]
    Agent(#[from] AgentError),

    #[error("Recording VM: {0}")]
    State(#[from] ConfigError),
}

/// A VM of this deployment together with the agent running on it.
#[derive(Clone)]
pub struct Vm {
    cid: String,
    cloud: Arc<dyn Cloud>,
    agent: Arc<dyn AgentClient>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm").field("cid", &self.cid).finish()
    }
}

impl Vm {
    pub fn new(cid: impl Into<String>, cloud: Arc<dyn Cloud>, agent: Arc<dyn AgentClient>) -> Self {
        Self {
            cid: cid.into(),
            cloud,
            agent,
        }
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub async fn exists(&self) -> Result<bool, VmError> {
        Ok(self.cloud.has_vm(&self.cid).await?)
    }

    pub async fn wait_until_ready(&self, policy: RetryPolicy) -> Result<(), VmError> {
        Ok(self.agent.wait_until_ready(policy).await?)
    }

    pub async fn apply(&self, spec: &Value) -> Result<(), VmError> {
        Ok(self.agent.apply(spec).await?)
    }

    pub async fn start(&self) -> Result<(), VmError> {
        Ok(self.agent.start().await?)
    }

    pub async fn wait_until_running(&self, policy: RetryPolicy) -> Result<(), VmError> {
        Ok(self.agent.wait_until_running(policy).await?)
    }

    /// Attach through the CPI, then have the agent mount it.
    pub async fn attach_disk(&self, disk_cid: &str) -> Result<(), VmError> {
        self.cloud.attach_disk(&self.cid, disk_cid).await?;
        self.agent.mount_disk(disk_cid).await?;
        Ok(())
    }

    pub async fn unmount_disk(&self, disk_cid: &str) -> Result<(), VmError> {
        Ok(self.agent.unmount_disk(disk_cid).await?)
    }

    pub async fn detach_disk(&self, disk_cid: &str) -> Result<(), VmError> {
        Ok(self.cloud.detach_disk(&self.cid, disk_cid).await?)
    }

    pub async fn migrate_disk(&self) -> Result<(), VmError> {
        Ok(self.agent.migrate_disk().await?)
    }

    pub async fn mounted_disks(&self) -> Result<Vec<String>, VmError> {
        Ok(self.agent.list_disk().await?)
    }
}

/// Creates, finds and deletes the deployment's VM, keeping the deployment
/// state's current VM in step with the cloud.
pub struct VmManager {
    cloud: Arc<dyn Cloud>,
    agent: Arc<dyn AgentClient>,
    state: Arc<dyn DeploymentStateService>,
}

impl VmManager {
    pub fn new(
        cloud: Arc<dyn Cloud>,
        agent: Arc<dyn AgentClient>,
        state: Arc<dyn DeploymentStateService>,
    ) -> Self {
        Self {
            cloud,
            agent,
            state,
        }
    }

    /// The recorded VM, if any. Its existence in the cloud is not checked.
    pub fn find_current(&self) -> Result<Option<Vm>, VmError> {
        let state = self.state.load()?;
        Ok(state
            .current_vm_cid
            .map(|cid| Vm::new(cid, self.cloud.clone(), self.agent.clone())))
    }

    pub async fn create(
        &self,
        stemcell: &CloudStemcell,
        manifest: &DeploymentManifest,
        disk_cids: &[String],
    ) -> Result<Vm, VmError> {
        let agent_id = Uuid::new_v4().to_string();
        let resource_pool = &manifest.resource_pool;
        let env = merge_env(&resource_pool.env, manifest);

        let cid = self
            .cloud
            .create_vm(
                &agent_id,
                &stemcell.cid,
                &resource_pool.cloud_properties,
                &manifest.network_settings(),
                disk_cids,
                &env,
            )
            .await?;

        self.state
            .update(&mut |state| state.current_vm_cid = Some(cid.clone()))?;
        info!("Created VM {} with agent {}", cid, agent_id);
        Ok(Vm::new(cid, self.cloud.clone(), self.agent.clone()))
    }

    /// Stop the agent (best-effort), detach `disk_cid` and delete the VM.
    /// A VM the cloud no longer knows about is just forgotten.
    pub async fn delete(&self, vm: &Vm, disk_cid: Option<&str>) -> Result<(), VmError> {
        if vm.exists().await? {
            if let Err(e) = self.agent.stop().await {
                warn!("Stopping agent on VM {} failed, continuing: {}", vm.cid(), e);
            }
            if let Some(disk_cid) = disk_cid {
                vm.detach_disk(disk_cid).await?;
            }
            self.cloud.delete_vm(vm.cid()).await?;
            info!("Deleted VM {}", vm.cid());
        } else {
            warn!("VM {} no longer exists, removing it from the deployment", vm.cid());
        }

        self.state.update(&mut |state| state.current_vm_cid = None)?;
        Ok(())
    }
}

/// Resource pool env plus the registry and mbus endpoints the agent
/// needs to bootstrap.
fn merge_env(env: &Value, manifest: &DeploymentManifest) -> Value {
    let mut merged = match env {
        Value::Object(map) => Value::Object(map.clone()),
        _ => json!({}),
    };
    let registry = &manifest.cloud_provider.registry;
    merged["bosh"] = json!({
        "mbus": manifest.cloud_provider.mbus,
        "registry": {
            "host": registry.host,
            "port": registry.port,
        },
    });
    merged
}
