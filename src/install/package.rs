use super::InstallError;
use crate::archive;
use crate::blobstore::Blobstore;
use crate::compile::CompiledPackageRecord;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Extracts compiled package blobs into `<packages_dir>/<name>`.
#[derive(Clone)]
pub struct PackageInstaller {
    blobstore: Arc<dyn Blobstore>,
}

impl PackageInstaller {
    pub fn new(blobstore: Arc<dyn Blobstore>) -> Self {
        Self { blobstore }
    }

    /// Replace any previous install of `name` with the contents of `record`.
    pub async fn install(
        &self,
        name: &str,
        record: &CompiledPackageRecord,
        packages_dir: &Path,
    ) -> Result<PathBuf, InstallError> {
        let blob_path = self.blobstore.get(&record.blob)?;
        let target = packages_dir.join(name);

        if target.exists() {
            std::fs::remove_dir_all(&target).map_err(|source| InstallError::Io {
                path: target.clone(),
                source,
            })?;
        }

        archive::extract(&blob_path, &target).await?;
        debug!("Installed package {} into {:?}", name, target);
        Ok(target)
    }
}
