use super::{Cloud, CloudError, CpiFailure, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A call observed by [`FakeCloud`].
#[derive(Debug, Clone, PartialEq)]
pub enum CloudCall {
    CreateStemcell {
        image_path: PathBuf,
        cloud_properties: Value,
    },
    DeleteStemcell(String),
    CreateVm {
        agent_id: String,
        stemcell_cid: String,
        disk_cids: Vec<String>,
    },
    HasVm(String),
    DeleteVm(String),
    CreateDisk {
        size_mb: u64,
        vm_cid: String,
    },
    AttachDisk {
        vm_cid: String,
        disk_cid: String,
    },
    DetachDisk {
        vm_cid: String,
        disk_cid: String,
    },
    DeleteDisk(String),
}

#[derive(Default)]
struct FakeCloudState {
    calls: Vec<CloudCall>,
    next_id: usize,
    vms: HashSet<String>,
    failures: HashMap<&'static str, String>,
}

/// In-memory cloud that hands out sequential CIDs and records every call.
///
/// Failures can be injected per method name; the error is returned as a
/// CPI error with class `FakeError`.
#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeCloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, method: &'static str, message: impl Into<String>) {
        self.lock().failures.insert(method, message.into());
    }

    pub fn clear_failure(&self, method: &str) {
        self.lock().failures.remove(method);
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.lock().calls.clone()
    }

    /// Forget a VM so that `has_vm` reports it gone.
    pub fn lose_vm(&self, vm_cid: &str) {
        self.lock().vms.remove(vm_cid);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeCloudState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, method: &'static str, call: CloudCall) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(call);
        match state.failures.get(method) {
            Some(message) => Err(CloudError::Cpi {
                method: method.to_string(),
                failure: CpiFailure {
                    class: "FakeError".to_string(),
                    message: message.clone(),
                    ok_to_retry: false,
                },
            }),
            None => Ok(()),
        }
    }

    fn next_cid(&self, prefix: &str) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }
}

#[async_trait]
impl Cloud for FakeCloud {
    async fn create_stemcell(
        &self,
        image_path: &Path,
        cloud_properties: &Value,
    ) -> Result<String> {
        self.record(
            "create_stemcell",
            CloudCall::CreateStemcell {
                image_path: image_path.to_path_buf(),
                cloud_properties: cloud_properties.clone(),
            },
        )?;
        Ok(self.next_cid("stemcell"))
    }

    async fn delete_stemcell(&self, stemcell_cid: &str) -> Result<()> {
        self.record(
            "delete_stemcell",
            CloudCall::DeleteStemcell(stemcell_cid.to_string()),
        )
    }

    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        _cloud_properties: &Value,
        _networks: &Value,
        disk_cids: &[String],
        _env: &Value,
    ) -> Result<String> {
        self.record(
            "create_vm",
            CloudCall::CreateVm {
                agent_id: agent_id.to_string(),
                stemcell_cid: stemcell_cid.to_string(),
                disk_cids: disk_cids.to_vec(),
            },
        )?;
        let cid = self.next_cid("vm");
        self.lock().vms.insert(cid.clone());
        Ok(cid)
    }

    async fn has_vm(&self, vm_cid: &str) -> Result<bool> {
        self.record("has_vm", CloudCall::HasVm(vm_cid.to_string()))?;
        Ok(self.lock().vms.contains(vm_cid))
    }

    async fn delete_vm(&self, vm_cid: &str) -> Result<()> {
        self.record("delete_vm", CloudCall::DeleteVm(vm_cid.to_string()))?;
        self.lock().vms.remove(vm_cid);
        Ok(())
    }

    async fn create_disk(
        &self,
        size_mb: u64,
        _cloud_properties: &Value,
        vm_cid: &str,
    ) -> Result<String> {
        self.record(
            "create_disk",
            CloudCall::CreateDisk {
                size_mb,
                vm_cid: vm_cid.to_string(),
            },
        )?;
        Ok(self.next_cid("disk"))
    }

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<()> {
        self.record(
            "attach_disk",
            CloudCall::AttachDisk {
                vm_cid: vm_cid.to_string(),
                disk_cid: disk_cid.to_string(),
            },
        )
    }

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<()> {
        self.record(
            "detach_disk",
            CloudCall::DetachDisk {
                vm_cid: vm_cid.to_string(),
                disk_cid: disk_cid.to_string(),
            },
        )
    }

    async fn delete_disk(&self, disk_cid: &str) -> Result<()> {
        self.record("delete_disk", CloudCall::DeleteDisk(disk_cid.to_string()))
    }
}
