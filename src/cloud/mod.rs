//! Cloud Provider Interface: the operations a deploy needs from the
//! infrastructure, and the subprocess client that speaks the CPI contract.

pub mod cpi;
pub mod fake;

pub use cpi::CpiCloud;
pub use fake::{CloudCall, FakeCloud};

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

/// Error payload returned by the CPI itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CpiFailure {
    pub class: String,
    pub message: String,
    pub ok_to_retry: bool,
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error(
        "CPI '{method}' method responded with error: {}: {} (ok_to_retry: {})",
        .failure.class, .failure.message, .failure.ok_to_retry
    )]
    Cpi {
        method: String,
        #[source]
        failure: CpiFailure,
    },

    #[error("Executing CPI command for '{method}': {reason}")]
    Exec { method: String, reason: String },

    #[error("Marshaling CPI request for '{method}': {source}")]
    Serialization {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[async_trait]
pub trait Cloud: Send + Sync {
    async fn create_stemcell(&self, image_path: &Path, cloud_properties: &Value)
        -> Result<String>;

    async fn delete_stemcell(&self, stemcell_cid: &str) -> Result<()>;

    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        cloud_properties: &Value,
        networks: &Value,
        disk_cids: &[String],
        env: &Value,
    ) -> Result<String>;

    async fn has_vm(&self, vm_cid: &str) -> Result<bool>;

    async fn delete_vm(&self, vm_cid: &str) -> Result<()>;

    async fn create_disk(&self, size_mb: u64, cloud_properties: &Value, vm_cid: &str)
        -> Result<String>;

    async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<()>;

    async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<()>;

    async fn delete_disk(&self, disk_cid: &str) -> Result<()>;
}
