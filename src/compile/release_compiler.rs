use super::{CompileError, ReleasePackagesCompiler};
use crate::blobstore::BlobRef;
use crate::index::{fingerprint, IndexError};
use crate::release::Release;
use crate::templates::{TemplateRecord, TemplatesCompiler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPackageRef {
    pub name: String,
    pub version: String,
    pub fingerprint: String,
    /// Direct dependencies, by package name.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub blob: BlobRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledJob {
    pub name: String,
    pub version: String,
    pub packages: Vec<String>,
    /// Archive of the rendered templates.
    pub blob: BlobRef,
}

/// Everything needed to install or apply a release: one blob per package
/// and one rendered-templates blob per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRelease {
    pub name: String,
    pub version: String,
    pub packages: BTreeMap<String, CompiledPackageRef>,
    pub jobs: BTreeMap<String, CompiledJob>,
}

impl CompiledRelease {
    /// Stable digest over every blob of the release; changes whenever any
    /// package or rendered job changes.
    pub fn digest(&self) -> Result<String, IndexError> {
        fingerprint(self)
    }

    /// The named packages plus everything they depend on, directly or
    /// transitively, ordered by name. Fails with the first name that has no
    /// compiled package.
    pub fn package_closure<'a>(
        &'a self,
        names: &'a [String],
    ) -> Result<Vec<&'a CompiledPackageRef>, &'a str> {
        let mut closure: BTreeMap<&str, &CompiledPackageRef> = BTreeMap::new();
        let mut pending: Vec<&str> = names.iter().map(String::as_str).collect();
        while let Some(name) = pending.pop() {
            if closure.contains_key(name) {
                continue;
            }
            let package = self.packages.get(name).ok_or(name)?;
            closure.insert(name, package);
            pending.extend(package.dependencies.iter().map(String::as_str));
        }
        Ok(closure.into_values().collect())
    }
}

pub struct ReleaseCompiler {
    packages_compiler: ReleasePackagesCompiler,
    templates_compiler: TemplatesCompiler,
}

impl ReleaseCompiler {
    pub fn new(
        packages_compiler: ReleasePackagesCompiler,
        templates_compiler: TemplatesCompiler,
    ) -> Self {
        Self {
            packages_compiler,
            templates_compiler,
        }
    }

    pub async fn compile(
        &self,
        release: &Release,
        deployment_name: &str,
        properties: &Value,
    ) -> Result<CompiledRelease, CompileError> {
        let records = self.packages_compiler.compile(release).await?;

        let mut packages = BTreeMap::new();
        for package in &release.packages {
            let record = records
                .get(&package.name)
                .ok_or_else(|| CompileError::BuildFailed {
                    package: package.name.clone(),
                    reason: "no compiled record produced".to_string(),
                })?;
            packages.insert(
                package.name.clone(),
                CompiledPackageRef {
                    name: package.name.clone(),
                    version: package.version.clone(),
                    fingerprint: package.fingerprint.clone(),
                    dependencies: package.dependencies.clone(),
                    blob: record.blob.clone(),
                },
            );
        }

        let mut rendered = self
            .templates_compiler
            .compile(&release.jobs, deployment_name, properties)
            .await?;
        let mut jobs = BTreeMap::new();
        for job in &release.jobs {
            let Some(TemplateRecord { blob }) = rendered.remove(&job.name) else {
                continue;
            };
            jobs.insert(
                job.name.clone(),
                CompiledJob {
                    name: job.name.clone(),
                    version: job.version.clone(),
                    packages: job.packages.clone(),
                    blob,
                },
            );
        }

        info!(
            "Compiled release {}/{} ({} packages, {} jobs)",
            release.name,
            release.version,
            packages.len(),
            jobs.len()
        );

        Ok(CompiledRelease {
            name: release.name.clone(),
            version: release.version.clone(),
            packages,
            jobs,
        })
    }
}
