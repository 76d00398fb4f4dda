//! Stemcells: reading the image tarball and uploading it to the cloud
//! at most once per distinct manifest.

pub mod manager;
pub mod reader;
pub mod repo;

pub use manager::StemcellManager;
pub use reader::StemcellReader;
pub use repo::{StateStemcellRepo, StemcellRepo};

use crate::archive::ArchiveError;
use crate::cloud::CloudError;
use crate::config::ConfigError;
use crate::index::{fingerprint, IndexError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tempfile::TempDir;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StemcellError {
    #[error("Extracting stemcell: {0}")]
    Extract(#[from] ArchiveError),

    #[error("Reading stemcell {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parsing stemcell manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("creating stemcell: {0}")]
    Cloud(#[from] CloudError),

    #[error("saving stemcell record: {0}")]
    Repo(#[from] ConfigError),

    #[error("Fingerprinting stemcell manifest: {0}")]
    Fingerprint(#[from] IndexError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemcellManifest {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// SHA-1 of the image as declared by the stemcell.
    #[serde(default)]
    pub sha1: String,
    #[serde(skip)]
    pub image_path: PathBuf,
    #[serde(default)]
    pub cloud_properties: Value,
    /// Defaults merged into every apply spec built on this stemcell.
    #[serde(skip)]
    pub apply_spec: Value,
}

impl StemcellManifest {
    /// Identity of the stemcell: everything except where its image was
    /// extracted to.
    pub fn fingerprint(&self) -> Result<String, IndexError> {
        #[derive(Serialize)]
        struct Key<'a> {
            name: &'a str,
            version: &'a str,
            sha1: &'a str,
            cloud_properties: &'a Value,
        }
        fingerprint(&Key {
            name: &self.name,
            version: &self.version,
            sha1: &self.sha1,
            cloud_properties: &self.cloud_properties,
        })
    }
}

/// A stemcell whose image sits on local disk. The extraction directory is
/// removed when this is dropped.
#[derive(Debug)]
pub struct ExtractedStemcell {
    manifest: StemcellManifest,
    _workspace: Option<TempDir>,
}

impl ExtractedStemcell {
    pub fn new(manifest: StemcellManifest) -> Self {
        Self {
            manifest,
            _workspace: None,
        }
    }

    pub(crate) fn with_workspace(manifest: StemcellManifest, workspace: TempDir) -> Self {
        Self {
            manifest,
            _workspace: Some(workspace),
        }
    }

    pub fn manifest(&self) -> &StemcellManifest {
        &self.manifest
    }
}

/// A stemcell known to the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudStemcell {
    pub id: String,
    pub name: String,
    pub version: String,
    pub cid: String,
}
