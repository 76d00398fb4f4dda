use super::{Job, Package, PropertyDefinition, Release, ReleaseError};
use crate::archive;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct ReleaseManifest {
    name: String,
    version: String,
    #[serde(default)]
    packages: Vec<Package>,
    #[serde(default)]
    jobs: Vec<JobRef>,
}

#[derive(Debug, Deserialize)]
struct JobRef {
    name: String,
    version: String,
    fingerprint: String,
    sha1: String,
}

#[derive(Debug, Deserialize)]
struct JobManifest {
    #[serde(default)]
    templates: BTreeMap<String, String>,
    #[serde(default)]
    packages: Vec<String>,
    #[serde(default)]
    properties: BTreeMap<String, PropertyDefinition>,
}

/// Reads a release tarball laid out as `release.MF`, `packages/<name>.tgz`
/// and `jobs/<name>.tgz` (each job archive carrying a `job.MF`).
#[derive(Debug, Default)]
pub struct ReleaseReader;

impl ReleaseReader {
    pub fn new() -> Self {
        Self
    }

    pub async fn read(&self, tarball: &Path) -> Result<Release, ReleaseError> {
        info!("Reading release from {:?}", tarball);
        let workspace = TempDir::new().map_err(|source| ReleaseError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        archive::extract(tarball, workspace.path()).await?;

        let release = self.read_dir(workspace.path()).await?;
        Ok(release.with_workspace(workspace))
    }

    /// Read an already-extracted release directory.
    pub async fn read_dir(&self, dir: &Path) -> Result<Release, ReleaseError> {
        let manifest_path = dir.join("release.MF");
        let manifest: ReleaseManifest = read_yaml(&manifest_path)?;

        let packages = manifest
            .packages
            .into_iter()
            .map(|mut package| {
                package.archive_path = dir.join("packages").join(format!("{}.tgz", package.name));
                package
            })
            .collect::<Vec<_>>();

        let mut jobs = Vec::with_capacity(manifest.jobs.len());
        for job_ref in manifest.jobs {
            let archive_path = dir.join("jobs").join(format!("{}.tgz", job_ref.name));
            let extracted_path = dir.join("extracted_jobs").join(&job_ref.name);
            archive::extract(&archive_path, &extracted_path).await?;

            let job_manifest: JobManifest = read_yaml(&extracted_path.join("job.MF"))?;
            debug!(
                "Read job {} with {} templates",
                job_ref.name,
                job_manifest.templates.len()
            );
            jobs.push(Job {
                name: job_ref.name,
                version: job_ref.version,
                fingerprint: job_ref.fingerprint,
                sha1: job_ref.sha1,
                templates: job_manifest.templates,
                packages: job_manifest.packages,
                properties: job_manifest.properties,
                extracted_path,
                archive_path,
            });
        }

        let mut release = Release::new(manifest.name, manifest.version, packages, jobs);
        release.extracted_path = dir.to_path_buf();
        Ok(release)
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ReleaseError> {
    let content = std::fs::read_to_string(path).map_err(|source| ReleaseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ReleaseError::Manifest {
        path: path.to_path_buf(),
        source,
    })
}
