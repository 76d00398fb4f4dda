//! Solo Deploy - single-instance deployer
//!
//! Compiles releases locally with content-addressed caching of packages and
//! rendered templates, installs a Cloud Provider Interface from its own
//! release, and converges one VM (stemcell, VM, persistent disk, agent
//! apply) through that CPI.

pub mod agent;
pub mod archive;
pub mod blobstore;
pub mod cloud;
pub mod compile;
pub mod config;
pub mod deployment;
pub mod eventlog;
pub mod index;
pub mod install;
pub mod manifest;
pub mod release;
pub mod stemcell;
pub mod templates;

pub use config::{DeployerConfig, DeploymentState};
pub use deployment::{DeployError, Deployer};
pub use manifest::DeploymentManifest;
