use super::{InstallError, PackageInstaller};
use crate::archive;
use crate::blobstore::Blobstore;
use crate::compile::{CompiledPackageRecord, CompiledRelease};
use crate::eventlog::{failure_message, EventLogger, Stage};
use crate::release::Job;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Lays out rendered jobs under `<jobs_dir>/<name>` together with the
/// packages they depend on, so their `bin/` executables can be run locally.
pub struct JobInstaller {
    blobstore: Arc<dyn Blobstore>,
    package_installer: PackageInstaller,
    jobs_dir: PathBuf,
    packages_dir: PathBuf,
    event_logger: Arc<dyn EventLogger>,
}

impl JobInstaller {
    pub fn new(
        blobstore: Arc<dyn Blobstore>,
        package_installer: PackageInstaller,
        jobs_dir: impl Into<PathBuf>,
        packages_dir: impl Into<PathBuf>,
        event_logger: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            blobstore,
            package_installer,
            jobs_dir: jobs_dir.into(),
            packages_dir: packages_dir.into(),
            event_logger,
        }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Install every job in order, returning the install directory of each.
    pub async fn install_all(
        &self,
        jobs: &[Job],
        compiled: &CompiledRelease,
    ) -> Result<Vec<PathBuf>, InstallError> {
        let stage = Stage::new(self.event_logger.clone(), "installing CPI jobs");
        stage.start();

        let mut installed = Vec::with_capacity(jobs.len());
        for job in jobs {
            match stage.perform(job.name.clone(), self.install(job, compiled)).await {
                Ok(path) => installed.push(path),
                Err(e) => {
                    stage.fail(failure_message(&e));
                    return Err(e);
                }
            }
        }

        stage.finish();
        Ok(installed)
    }

    pub async fn install(
        &self,
        job: &Job,
        compiled: &CompiledRelease,
    ) -> Result<PathBuf, InstallError> {
        let record = compiled
            .jobs
            .get(&job.name)
            .ok_or_else(|| InstallError::MissingTemplates {
                job: job.name.clone(),
            })?;

        let closure = compiled.package_closure(&job.packages).map_err(|missing| {
            InstallError::MissingPackage {
                job: job.name.clone(),
                package: missing.to_string(),
            }
        })?;
        for package in closure {
            let package_record = CompiledPackageRecord {
                blob: package.blob.clone(),
            };
            self.package_installer
                .install(&package.name, &package_record, &self.packages_dir)
                .await?;
        }

        let blob_path = self.blobstore.get(&record.blob)?;
        let target = self.jobs_dir.join(&job.name);
        if target.exists() {
            std::fs::remove_dir_all(&target).map_err(|source| InstallError::Io {
                path: target.clone(),
                source,
            })?;
        }
        archive::extract(&blob_path, &target).await?;
        mark_executables(&target.join("bin"))?;

        info!("Installed job {} into {:?}", job.name, target);
        Ok(target)
    }
}

#[cfg(unix)]
fn mark_executables(bin_dir: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;

    if !bin_dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(bin_dir).map_err(io_err(bin_dir))? {
        let path = entry.map_err(io_err(bin_dir))?.path();
        if !path.is_file() {
            continue;
        }
        let mut perms = std::fs::metadata(&path).map_err(io_err(&path))?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(&path, perms).map_err(io_err(&path))?;
        debug!("Marked {:?} executable", path);
    }
    Ok(())
}

#[cfg(unix)]
fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> InstallError {
    let path = path.to_path_buf();
    move |source| InstallError::Io { path, source }
}

#[cfg(not(unix))]
fn mark_executables(_bin_dir: &Path) -> Result<(), InstallError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::{BlobRef, LocalBlobstore};
    use crate::compile::{CompiledJob, CompiledPackageRef};
    use crate::eventlog::{EventState, RecordingEventLogger};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn store_dir(
        blobstore: &LocalBlobstore,
        scratch: &Path,
        name: &str,
        files: &[(&str, &str)],
    ) -> BlobRef {
        let src = scratch.join(name);
        for (rel, content) in files {
            let path = src.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let tarball = scratch.join(format!("{name}.tgz"));
        archive::compress_dir(&src, &tarball).await.unwrap();
        blobstore.create(&tarball).unwrap()
    }

    fn compiled_job(blob: BlobRef) -> CompiledJob {
        CompiledJob {
            name: "cpi".to_string(),
            version: "1".to_string(),
            packages: vec!["ruby".to_string()],
            blob,
        }
    }

    fn job(packages: &[&str]) -> Job {
        Job {
            name: "cpi".to_string(),
            version: "1".to_string(),
            fingerprint: "fp".to_string(),
            sha1: String::new(),
            templates: BTreeMap::new(),
            packages: packages.iter().map(|p| p.to_string()).collect(),
            properties: BTreeMap::new(),
            extracted_path: PathBuf::new(),
            archive_path: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_installs_job_and_its_packages() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        let blobstore = Arc::new(LocalBlobstore::new(dir.path().join("blobs")));

        let templates = store_dir(&blobstore, &scratch, "tpl", &[("bin/cpi", "#!/bin/sh\n")]).await;
        let ruby = store_dir(&blobstore, &scratch, "ruby", &[("bin/ruby", "ruby")]).await;
        let libyaml = store_dir(&blobstore, &scratch, "libyaml", &[("lib/libyaml.so", "so")]).await;

        let mut packages = BTreeMap::new();
        packages.insert(
            "ruby".to_string(),
            CompiledPackageRef {
                name: "ruby".to_string(),
                version: "2".to_string(),
                fingerprint: "fp".to_string(),
                dependencies: vec!["libyaml".to_string()],
                blob: ruby,
            },
        );
        packages.insert(
            "libyaml".to_string(),
            CompiledPackageRef {
                name: "libyaml".to_string(),
                version: "1".to_string(),
                fingerprint: "fp-yaml".to_string(),
                dependencies: vec![],
                blob: libyaml,
            },
        );
        let mut jobs = BTreeMap::new();
        jobs.insert("cpi".to_string(), compiled_job(templates));
        let compiled = CompiledRelease {
            name: "cpi-release".to_string(),
            version: "1".to_string(),
            packages,
            jobs,
        };

        let logger = Arc::new(RecordingEventLogger::new());
        let installer = JobInstaller::new(
            blobstore.clone(),
            PackageInstaller::new(blobstore),
            dir.path().join("jobs"),
            dir.path().join("packages"),
            logger.clone(),
        );

        let installed = installer
            .install_all(&[job(&["ruby"])], &compiled)
            .await
            .unwrap();

        assert_eq!(installed, vec![dir.path().join("jobs/cpi")]);
        assert!(dir.path().join("packages/ruby/bin/ruby").exists());
        assert!(dir.path().join("packages/libyaml/lib/libyaml.so").exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("jobs/cpi/bin/cpi"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
        assert_eq!(
            logger.step_states("installing CPI jobs", "cpi"),
            vec![EventState::Started, EventState::Finished]
        );
    }

    #[tokio::test]
    async fn test_missing_package_fails_step() {
        let dir = TempDir::new().unwrap();
        let blobstore = Arc::new(LocalBlobstore::new(dir.path().join("blobs")));
        let templates = store_dir(&blobstore, dir.path(), "tpl", &[("bin/cpi", "x")]).await;
        let mut jobs = BTreeMap::new();
        jobs.insert("cpi".to_string(), compiled_job(templates));
        let compiled = CompiledRelease {
            name: "cpi-release".to_string(),
            version: "1".to_string(),
            packages: BTreeMap::new(),
            jobs,
        };
        let logger = Arc::new(RecordingEventLogger::new());
        let installer = JobInstaller::new(
            blobstore.clone(),
            PackageInstaller::new(blobstore),
            dir.path().join("jobs"),
            dir.path().join("packages"),
            logger.clone(),
        );

        let err = installer
            .install_all(&[job(&["ruby"])], &compiled)
            .await
            .unwrap_err();

        assert!(matches!(err, InstallError::MissingPackage { .. }));
        assert_eq!(
            logger.step_states("installing CPI jobs", "cpi"),
            vec![EventState::Started, EventState::Failed]
        );
    }
}
