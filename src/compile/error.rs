use crate::archive::ArchiveError;
use crate::blobstore::BlobstoreError;
use crate::index::IndexError;
use crate::templates::TemplatesError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Dependency cycle detected between packages: {}", packages.join(", "))]
    DependencyCycle { packages: Vec<String> },

    #[error("Package '{package}' depends on unknown package '{dependency}'")]
    UnknownDependency { package: String, dependency: String },

    #[error("Compiling package '{package}': {reason}")]
    BuildFailed { package: String, reason: String },

    #[error("{operation}: {source}")]
    Cache {
        operation: String,
        #[source]
        source: IndexError,
    },

    #[error("Preparing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blobstore error: {0}")]
    Blobstore(#[from] BlobstoreError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Installing dependency: {0}")]
    Install(#[from] crate::install::InstallError),

    #[error("Compiling job templates: {0}")]
    Templates(#[from] TemplatesError),
}

impl CompileError {
    pub(crate) fn cache(operation: impl Into<String>, source: IndexError) -> Self {
        Self::Cache {
            operation: operation.into(),
            source,
        }
    }
}
