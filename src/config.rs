//! Workspace layout and the persisted state of the current deployment.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Parsing deployment manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Validating deployment manifest: {}", errors.join("; "))]
    InvalidManifest { errors: Vec<String> },

    #[error("Deployment state lock poisoned")]
    Poisoned,
}

/// Where everything the deployer keeps between runs lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployerConfig {
    pub workspace: PathBuf,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            workspace: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".solo-deploy"),
        }
    }
}

impl DeployerConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    pub fn compiled_packages_index(&self) -> PathBuf {
        self.workspace.join("compiled_packages.json")
    }

    pub fn templates_index(&self) -> PathBuf {
        self.workspace.join("templates.json")
    }

    pub fn blobstore_dir(&self) -> PathBuf {
        self.workspace.join("blobs")
    }

    /// Dependencies staged here while a package's build script runs.
    pub fn compile_packages_dir(&self) -> PathBuf {
        self.workspace.join("compile").join("packages")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.workspace.join("packages")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.workspace.join("jobs")
    }

    pub fn state_file(&self) -> PathBuf {
        self.workspace.join("deployment.json")
    }

    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [
            self.workspace.clone(),
            self.blobstore_dir(),
            self.compile_packages_dir(),
            self.packages_dir(),
            self.jobs_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Write {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub id: String,
    pub cid: String,
    pub size_mb: u64,
    #[serde(default)]
    pub cloud_properties: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemcellRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub cid: String,
    pub fingerprint: String,
}

/// Everything that has converged for this deployment so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub director_id: String,
    #[serde(default)]
    pub current_vm_cid: Option<String>,
    #[serde(default)]
    pub current_disk_id: Option<String>,
    #[serde(default)]
    pub disks: Vec<DiskRecord>,
    #[serde(default)]
    pub current_stemcell_id: Option<String>,
    #[serde(default)]
    pub stemcells: Vec<StemcellRecord>,
    #[serde(default)]
    pub current_manifest_digest: Option<String>,
    #[serde(default)]
    pub current_release_digest: Option<String>,
}

impl DeploymentState {
    pub fn fresh() -> Self {
        Self {
            director_id: Uuid::new_v4().to_string(),
            current_vm_cid: None,
            current_disk_id: None,
            disks: Vec::new(),
            current_stemcell_id: None,
            stemcells: Vec::new(),
            current_manifest_digest: None,
            current_release_digest: None,
        }
    }

    pub fn current_disk(&self) -> Option<&DiskRecord> {
        let id = self.current_disk_id.as_deref()?;
        self.disks.iter().find(|d| d.id == id)
    }
}

/// Loads and saves [`DeploymentState`]. A missing state is created fresh
/// with a new director id and persisted immediately.
pub trait DeploymentStateService: Send + Sync {
    fn load(&self) -> Result<DeploymentState, ConfigError>;

    fn save(&self, state: &DeploymentState) -> Result<(), ConfigError>;

    /// Load, apply `change` and save in one step.
    fn update(
        &self,
        change: &mut dyn FnMut(&mut DeploymentState),
    ) -> Result<DeploymentState, ConfigError> {
        let mut state = self.load()?;
        change(&mut state);
        self.save(&state)?;
        Ok(state)
    }
}

pub struct FileDeploymentStateService {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileDeploymentStateService {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, state: &DeploymentState) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(state).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, json).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

impl DeploymentStateService for FileDeploymentStateService {
    fn load(&self) -> Result<DeploymentState, ConfigError> {
        let _guard = self.guard.lock().map_err(|_| ConfigError::Poisoned)?;
        if !self.path.exists() {
            let state = DeploymentState::fresh();
            info!(
                "Creating deployment state {:?} for director {}",
                self.path, state.director_id
            );
            self.write(&state)?;
            return Ok(state);
        }

        let content = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, state: &DeploymentState) -> Result<(), ConfigError> {
        let _guard = self.guard.lock().map_err(|_| ConfigError::Poisoned)?;
        debug!("Saving deployment state to {:?}", self.path);
        self.write(state)
    }
}

/// Keeps the state in memory; used for dry runs and tests.
pub struct InMemoryDeploymentStateService {
    state: Mutex<Option<DeploymentState>>,
}

impl Default for InMemoryDeploymentStateService {
    fn default() -> Self {
        Self {
            state: Mutex::new(None),
        }
    }
}

impl InMemoryDeploymentStateService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeploymentStateService for InMemoryDeploymentStateService {
    fn load(&self) -> Result<DeploymentState, ConfigError> {
        let mut state = self.state.lock().map_err(|_| ConfigError::Poisoned)?;
        Ok(state.get_or_insert_with(DeploymentState::fresh).clone())
    }

    fn save(&self, state: &DeploymentState) -> Result<(), ConfigError> {
        *self.state.lock().map_err(|_| ConfigError::Poisoned)? = Some(state.clone());
        Ok(())
    }
}
