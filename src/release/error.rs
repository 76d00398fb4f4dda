use crate::archive::ArchiveError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("Validating release: {}", errors.join("; "))]
    Validation { errors: Vec<String> },

    #[error("Parsing {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Extracting release: {0}")]
    Archive(#[from] ArchiveError),
}
