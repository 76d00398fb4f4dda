use super::{ExtractedStemcell, StemcellError, StemcellManifest};
use crate::archive;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;
use tracing::info;

const MANIFEST_FILE: &str = "stemcell.MF";
const APPLY_SPEC_FILE: &str = "apply_spec.yml";
const IMAGE_FILE: &str = "image";

/// Extracts a stemcell tarball holding `stemcell.MF`, `image` and an
/// optional `apply_spec.yml`.
#[derive(Debug, Default)]
pub struct StemcellReader;

impl StemcellReader {
    pub fn new() -> Self {
        Self
    }

    pub async fn read(&self, tarball: &Path) -> Result<ExtractedStemcell, StemcellError> {
        info!("Extracting stemcell from {:?}", tarball);
        let workspace = TempDir::new().map_err(|source| StemcellError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        archive::extract(tarball, workspace.path()).await?;

        let manifest = self.read_dir(workspace.path())?;
        Ok(ExtractedStemcell::with_workspace(manifest, workspace))
    }

    pub fn read_dir(&self, dir: &Path) -> Result<StemcellManifest, StemcellError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let mut manifest: StemcellManifest = read_yaml(&manifest_path)?;
        manifest.image_path = dir.join(IMAGE_FILE);

        let apply_spec_path = dir.join(APPLY_SPEC_FILE);
        manifest.apply_spec = if apply_spec_path.exists() {
            read_yaml(&apply_spec_path)?
        } else {
            Value::Null
        };
        Ok(manifest)
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StemcellError> {
    let content = std::fs::read_to_string(path).map_err(|source| StemcellError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| StemcellError::Manifest {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_manifest_and_apply_spec() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(
            src.join(MANIFEST_FILE),
            "name: ubuntu\nversion: \"3000\"\nsha1: abc\ncloud_properties:\n  disk: 10\n",
        )
        .unwrap();
        std::fs::write(src.join(IMAGE_FILE), "image-bytes").unwrap();
        std::fs::write(src.join(APPLY_SPEC_FILE), "packages: {}\n").unwrap();
        let tarball = dir.path().join("stemcell.tgz");
        archive::compress_dir(&src, &tarball).await.unwrap();

        let stemcell = StemcellReader::new().read(&tarball).await.unwrap();
        let manifest = stemcell.manifest();

        assert_eq!(manifest.name, "ubuntu");
        assert_eq!(manifest.version, "3000");
        assert_eq!(manifest.cloud_properties, json!({"disk": 10}));
        assert_eq!(manifest.apply_spec, json!({"packages": {}}));
        assert_eq!(std::fs::read_to_string(&manifest.image_path).unwrap(), "image-bytes");
    }

    #[test]
    fn test_missing_manifest_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = StemcellReader::new().read_dir(dir.path()).unwrap_err();
        assert!(matches!(err, StemcellError::Io { .. }));
    }
}
