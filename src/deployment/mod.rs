//! Converging the deployment's single VM: stemcell, VM, persistent disk,
//! bootstrap registry and tunnel, and the agent's apply/start cycle.

pub mod apply_spec;
pub mod deployer;
pub mod disk;
pub mod record;
pub mod registry;
pub mod tunnel;
pub mod vm;

pub use apply_spec::build_apply_spec;
pub use deployer::{Deployer, DeployerOptions};
pub use disk::{DiskError, DiskManager};
pub use record::DeploymentRecord;
pub use registry::{RegistryError, RegistryHandle, RegistryServer};
pub use tunnel::{SshTunnel, SshTunnelHandle, SshTunnelOptions};
pub use vm::{Vm, VmError, VmManager};

use crate::blobstore::BlobstoreError;
use crate::config::ConfigError;
use crate::index::IndexError;
use crate::stemcell::StemcellError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{0}")]
    InvalidManifest(ConfigError),

    #[error("Deployment state: {0}")]
    State(#[from] ConfigError),

    #[error("Uploading stemcell: {0}")]
    Stemcell(#[from] StemcellError),

    #[error("Deploying VM: {0}")]
    Vm(#[from] VmError),

    #[error("Converging persistent disk: {0}")]
    Disk(#[from] DiskError),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("Uploading artifacts to agent: {0}")]
    Blobstore(#[from] BlobstoreError),

    #[error("Computing deployment digest: {0}")]
    Digest(#[from] IndexError),

    #[error("Job '{job}' is not part of the compiled release")]
    MissingJob { job: String },

    #[error("Job '{job}' requires package '{package}' which was not compiled")]
    MissingPackage { job: String, package: String },
}
