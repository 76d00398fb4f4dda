//! Release definitions: packages, jobs and the on-disk release layout.

pub mod error;
pub mod reader;
pub mod validation;

pub use error::ReleaseError;
pub use reader::ReleaseReader;
pub use validation::{CpiReleaseValidator, ReleaseValidator};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;

/// A source package. Immutable once read from the release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub fingerprint: String,
    pub sha1: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Gzipped source archive containing the `packaging` script.
    #[serde(skip)]
    pub archive_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub version: String,
    pub fingerprint: String,
    pub sha1: String,
    /// Template source path (relative to `templates/`) -> rendered destination path.
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDefinition>,
    /// Directory holding the extracted job archive.
    #[serde(skip)]
    pub extracted_path: PathBuf,
    /// Gzipped job archive as shipped in the release.
    #[serde(skip)]
    pub archive_path: PathBuf,
}

impl Job {
    pub fn templates_dir(&self) -> PathBuf {
        self.extracted_path.join("templates")
    }
}

pub struct Release {
    pub name: String,
    pub version: String,
    pub packages: Vec<Package>,
    pub jobs: Vec<Job>,
    pub extracted_path: PathBuf,
    _workspace: Option<TempDir>,
}

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Release")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("packages", &self.packages)
            .field("jobs", &self.jobs)
            .field("extracted_path", &self.extracted_path)
            .finish()
    }
}

impl Release {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        packages: Vec<Package>,
        jobs: Vec<Job>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            packages,
            jobs,
            extracted_path: PathBuf::new(),
            _workspace: None,
        }
    }

    /// Attach the temp directory the release was extracted into; it is removed on drop.
    pub(crate) fn with_workspace(mut self, workspace: TempDir) -> Self {
        self.extracted_path = workspace.path().to_path_buf();
        self._workspace = Some(workspace);
        self
    }

    pub fn find_job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn find_package(&self, name: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.name == name)
    }
}
