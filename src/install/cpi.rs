use super::{InstallError, JobInstaller};
use crate::cloud::CpiCloud;
use crate::compile::{CompileError, CompiledRelease, ReleaseCompiler};
use crate::eventlog::{failure_message, EventLogger, Stage};
use crate::release::{CpiReleaseValidator, Release, ReleaseError, ReleaseReader, ReleaseValidator};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CpiInstallError {
    #[error("Reading CPI release: {0}")]
    Release(#[from] ReleaseError),

    #[error("Compiling CPI release: {0}")]
    Compile(#[from] CompileError),

    #[error("Installing CPI release: {0}")]
    Install(#[from] InstallError),
}

/// A CPI release that has been compiled and laid out locally.
#[derive(Debug, Clone)]
pub struct CpiInstallation {
    pub compiled: CompiledRelease,
    pub job_path: PathBuf,
    pub jobs_dir: PathBuf,
    pub packages_dir: PathBuf,
}

impl CpiInstallation {
    pub fn executable(&self) -> PathBuf {
        self.job_path.join("bin").join("cpi")
    }

    /// A cloud client that execs the installed CPI on behalf of `director_id`.
    pub fn cloud(&self, director_id: &str) -> CpiCloud {
        CpiCloud::new(self.executable(), director_id)
            .with_env("JOBS_DIR", self.jobs_dir.to_string_lossy())
            .with_env("PACKAGES_DIR", self.packages_dir.to_string_lossy())
    }
}

pub struct CpiInstaller {
    reader: ReleaseReader,
    validator: ReleaseValidator,
    cpi_validator: CpiReleaseValidator,
    compiler: ReleaseCompiler,
    job_installer: JobInstaller,
    packages_dir: PathBuf,
    event_logger: Arc<dyn EventLogger>,
}

impl CpiInstaller {
    pub fn new(
        reader: ReleaseReader,
        validator: ReleaseValidator,
        compiler: ReleaseCompiler,
        job_installer: JobInstaller,
        packages_dir: impl Into<PathBuf>,
        event_logger: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            reader,
            validator,
            cpi_validator: CpiReleaseValidator::new(),
            compiler,
            job_installer,
            packages_dir: packages_dir.into(),
            event_logger,
        }
    }

    pub async fn install(
        &self,
        tarball: &Path,
        deployment_name: &str,
        properties: &Value,
    ) -> Result<CpiInstallation, CpiInstallError> {
        let release = self.reader.read(tarball).await?;
        self.install_release(&release, deployment_name, properties)
            .await
    }

    /// Validate, compile and install an already-read CPI release. Validation
    /// failures are reported before any compilation starts.
    pub async fn install_release(
        &self,
        release: &Release,
        deployment_name: &str,
        properties: &Value,
    ) -> Result<CpiInstallation, CpiInstallError> {
        let stage = Stage::new(self.event_logger.clone(), "validating");
        stage.start();
        let validated = stage
            .perform("Validating cpi release", async {
                self.validator
                    .validate(release)
                    .and_then(|_| self.cpi_validator.validate(release))
            })
            .await;
        if let Err(e) = validated {
            stage.fail(failure_message(&e));
            return Err(e.into());
        }
        stage.finish();

        let compiled = self
            .compiler
            .compile(release, deployment_name, properties)
            .await?;

        let job_name = self.cpi_validator.job_name();
        let jobs: Vec<_> = release
            .jobs
            .iter()
            .filter(|job| job.name == job_name)
            .cloned()
            .collect();
        let mut installed = self.job_installer.install_all(&jobs, &compiled).await?;
        let job_path = installed
            .pop()
            .ok_or_else(|| InstallError::MissingTemplates {
                job: job_name.to_string(),
            })?;

        info!(
            "Installed CPI release {}/{} at {:?}",
            release.name, release.version, job_path
        );
        Ok(CpiInstallation {
            compiled,
            job_path,
            jobs_dir: self.job_installer.jobs_dir().to_path_buf(),
            packages_dir: self.packages_dir.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::{Blobstore, LocalBlobstore};
    use crate::compile::{
        CompiledDependency, CompiledPackageRecord, DependencyAnalyzer, IndexCompiledPackageRepo,
        PackageCompiler, ReleasePackagesCompiler,
    };
    use crate::eventlog::{EventState, RecordingEventLogger};
    use crate::index::InMemoryIndex;
    use crate::install::PackageInstaller;
    use crate::release::{Job, Package};
    use crate::templates::{HandlebarsJobRenderer, IndexTemplatesRepo, TemplatesCompiler};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct EmptyPackageCompiler {
        blobstore: Arc<dyn Blobstore>,
        scratch: PathBuf,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PackageCompiler for EmptyPackageCompiler {
        async fn compile(
            &self,
            package: &Package,
            _dependencies: &[CompiledDependency],
        ) -> Result<CompiledPackageRecord, CompileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let dir = self.scratch.join(&package.name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("marker"), &package.name).unwrap();
            let tarball = self.scratch.join(format!("{}.tgz", package.name));
            crate::archive::compress_dir(&dir, &tarball).await?;
            Ok(CompiledPackageRecord {
                blob: self.blobstore.create(&tarball)?,
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        installer: CpiInstaller,
        compiler: Arc<EmptyPackageCompiler>,
        logger: Arc<RecordingEventLogger>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let blobstore: Arc<dyn Blobstore> = Arc::new(LocalBlobstore::new(root.join("blobs")));
        let logger = Arc::new(RecordingEventLogger::new());
        let compiler = Arc::new(EmptyPackageCompiler {
            blobstore: blobstore.clone(),
            scratch: root.join("scratch"),
            calls: AtomicUsize::new(0),
        });
        let release_compiler = ReleaseCompiler::new(
            ReleasePackagesCompiler::new(
                DependencyAnalyzer::new(),
                compiler.clone(),
                Arc::new(IndexCompiledPackageRepo::new(Arc::new(InMemoryIndex::new()))),
                logger.clone(),
            ),
            TemplatesCompiler::new(
                Arc::new(HandlebarsJobRenderer::new()),
                blobstore.clone(),
                Arc::new(IndexTemplatesRepo::new(Arc::new(InMemoryIndex::new()))),
                logger.clone(),
            ),
        );
        let job_installer = JobInstaller::new(
            blobstore.clone(),
            PackageInstaller::new(blobstore),
            root.join("jobs"),
            root.join("packages"),
            logger.clone(),
        );
        let installer = CpiInstaller::new(
            ReleaseReader::new(),
            ReleaseValidator::without_archive_checks(),
            release_compiler,
            job_installer,
            root.join("packages"),
            logger.clone(),
        );
        Fixture {
            _dir: dir,
            root,
            installer,
            compiler,
            logger,
        }
    }

    fn cpi_release(root: &Path, with_cpi_job: bool) -> Release {
        let job_dir = root.join("job-src");
        std::fs::create_dir_all(job_dir.join("templates")).unwrap();
        std::fs::write(
            job_dir.join("templates/cpi.erb"),
            "#!/bin/sh\necho {{properties.cpi.region}}\n",
        )
        .unwrap();
        let job = Job {
            name: if with_cpi_job { "cpi" } else { "not-cpi" }.to_string(),
            version: "1".to_string(),
            fingerprint: "fp-cpi".to_string(),
            sha1: String::new(),
            templates: BTreeMap::from([("cpi.erb".to_string(), "bin/cpi".to_string())]),
            packages: vec!["cpi-ruby".to_string()],
            properties: BTreeMap::new(),
            extracted_path: job_dir,
            archive_path: Default::default(),
        };
        let package = Package {
            name: "cpi-ruby".to_string(),
            version: "1".to_string(),
            fingerprint: "fp-ruby".to_string(),
            sha1: String::new(),
            dependencies: vec![],
            archive_path: PathBuf::new(),
        };
        Release::new("cpi-release", "1", vec![package], vec![job])
    }

    #[tokio::test]
    async fn test_installs_cpi_executable() {
        let f = fixture();
        let release = cpi_release(&f.root, true);

        let installation = f
            .installer
            .install_release(&release, "dep", &Value::Null)
            .await
            .unwrap();

        assert_eq!(installation.executable(), f.root.join("jobs/cpi/bin/cpi"));
        assert!(installation.executable().exists());
        assert!(f.root.join("packages/cpi-ruby/marker").exists());
        assert_eq!(
            installation.cloud("director").executable(),
            installation.executable().as_path()
        );
    }

    #[tokio::test]
    async fn test_invalid_release_fails_before_compiling() {
        let f = fixture();
        let release = cpi_release(&f.root, false);

        let err = f
            .installer
            .install_release(&release, "dep", &Value::Null)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CpiInstallError::Release(ReleaseError::Validation { .. })
        ));
        assert_eq!(f.compiler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            f.logger.step_states("validating", "Validating cpi release"),
            vec![EventState::Started, EventState::Failed]
        );
        assert!(!f.logger.stages().contains(&"compiling packages".to_string()));
    }
}
