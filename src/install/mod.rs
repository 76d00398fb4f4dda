//! Installing compiled packages and rendered jobs onto the local machine,
//! and bootstrapping the CPI from its release.

pub mod cpi;
pub mod job;
pub mod package;

pub use cpi::{CpiInstallError, CpiInstallation, CpiInstaller};
pub use job::JobInstaller;
pub use package::PackageInstaller;

use crate::archive::ArchiveError;
use crate::blobstore::BlobstoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Blobstore error: {0}")]
    Blobstore(#[from] BlobstoreError),

    #[error("Extracting blob: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Preparing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No rendered templates for job '{job}'")]
    MissingTemplates { job: String },

    #[error("Job '{job}' requires package '{package}' which was not compiled")]
    MissingPackage { job: String, package: String },
}
