use super::{CompileError, CompiledPackageRecord};
use crate::archive;
use crate::blobstore::Blobstore;
use crate::install::PackageInstaller;
use crate::release::Package;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// An already-compiled dependency handed to the compiler.
#[derive(Debug, Clone)]
pub struct CompiledDependency {
    pub name: String,
    pub record: CompiledPackageRecord,
}

/// Builds one package. Does not consult or update the compiled-package cache.
#[async_trait]
pub trait PackageCompiler: Send + Sync {
    async fn compile(
        &self,
        package: &Package,
        dependencies: &[CompiledDependency],
    ) -> Result<CompiledPackageRecord, CompileError>;
}

/// Runs the package's `packaging` script with its dependencies installed
/// under `packages_dir`, then archives the install target into the blobstore.
///
/// The script sees `COMPILE_TARGET` (the unpacked sources), `INSTALL_TARGET`
/// (where it must place build output) and `PACKAGES_DIR`.
pub struct ScriptPackageCompiler {
    packages_dir: PathBuf,
    blobstore: Arc<dyn Blobstore>,
    package_installer: PackageInstaller,
}

impl ScriptPackageCompiler {
    pub fn new(
        packages_dir: impl Into<PathBuf>,
        blobstore: Arc<dyn Blobstore>,
        package_installer: PackageInstaller,
    ) -> Self {
        Self {
            packages_dir: packages_dir.into(),
            blobstore,
            package_installer,
        }
    }

    async fn run_packaging_script(
        &self,
        package: &Package,
        compile_dir: &Path,
        install_dir: &Path,
    ) -> Result<(), CompileError> {
        let script = compile_dir.join("packaging");
        if !script.exists() {
            return Err(CompileError::BuildFailed {
                package: package.name.clone(),
                reason: "packaging script is missing".to_string(),
            });
        }

        debug!("Running packaging script for {}", package.name);
        let output = Command::new("bash")
            .arg("-x")
            .arg("packaging")
            .current_dir(compile_dir)
            .env("COMPILE_TARGET", compile_dir)
            .env("INSTALL_TARGET", install_dir)
            .env("PACKAGES_DIR", &self.packages_dir)
            .output()
            .await
            .map_err(|e| CompileError::BuildFailed {
                package: package.name.clone(),
                reason: format!("Failed to execute packaging script: {e}"),
            })?;

        if !output.status.success() {
            return Err(CompileError::BuildFailed {
                package: package.name.clone(),
                reason: format!(
                    "packaging script exited with {}\nstdout:\n{}\nstderr:\n{}",
                    output.status,
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PackageCompiler for ScriptPackageCompiler {
    async fn compile(
        &self,
        package: &Package,
        dependencies: &[CompiledDependency],
    ) -> Result<CompiledPackageRecord, CompileError> {
        info!("Compiling package {}/{}", package.name, package.version);

        for dependency in dependencies {
            self.package_installer
                .install(&dependency.name, &dependency.record, &self.packages_dir)
                .await?;
        }

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CompileError::Io { path, source }
        };

        let workspace = tempfile::TempDir::new().map_err(io_err(&std::env::temp_dir()))?;
        let compile_dir = workspace.path().join("compile");
        archive::extract(&package.archive_path, &compile_dir).await?;

        let install_dir = self.packages_dir.join(&package.name);
        if install_dir.exists() {
            std::fs::remove_dir_all(&install_dir).map_err(io_err(&install_dir))?;
        }
        std::fs::create_dir_all(&install_dir).map_err(io_err(&install_dir))?;

        self.run_packaging_script(package, &compile_dir, &install_dir)
            .await?;

        let tarball = workspace.path().join("compiled.tgz");
        archive::compress_dir(&install_dir, &tarball).await?;
        let blob = self.blobstore.create(&tarball)?;

        info!(
            "Compiled package {} into blob {}",
            package.name, blob.blob_id
        );
        Ok(CompiledPackageRecord { blob })
    }
}
