use super::{CloudStemcell, ExtractedStemcell, StemcellError, StemcellRepo};
use crate::cloud::Cloud;
use crate::eventlog::{failure_message, EventLogger, Stage};
use std::sync::Arc;
use tracing::info;

/// Uploads stemcells through the CPI, at most once per manifest.
///
/// Cloud-side stemcell creation is slow and not idempotent, so a stemcell
/// already recorded in the repo is returned as-is without calling the CPI.
pub struct StemcellManager {
    repo: Arc<dyn StemcellRepo>,
    cloud: Arc<dyn Cloud>,
    event_logger: Arc<dyn EventLogger>,
}

impl StemcellManager {
    pub fn new(
        repo: Arc<dyn StemcellRepo>,
        cloud: Arc<dyn Cloud>,
        event_logger: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            repo,
            cloud,
            event_logger,
        }
    }

    pub async fn upload(&self, stemcell: &ExtractedStemcell) -> Result<CloudStemcell, StemcellError> {
        let manifest = stemcell.manifest();
        let stage = Stage::new(self.event_logger.clone(), "uploading stemcell");
        stage.start();
        let step = stage.new_step("Uploading");

        let found = match self.repo.find(manifest) {
            Ok(found) => found,
            Err(e) => {
                step.fail(failure_message(&e));
                stage.fail(failure_message(&e));
                return Err(e);
            }
        };
        if let Some(existing) = found {
            step.skip("Stemcell already uploaded");
            stage.finish();
            return Ok(existing);
        }

        step.start();
        match self.create_and_save(stemcell).await {
            Ok(cloud_stemcell) => {
                step.finish();
                stage.finish();
                info!(
                    "Uploaded stemcell {}/{} as {}",
                    cloud_stemcell.name, cloud_stemcell.version, cloud_stemcell.cid
                );
                Ok(cloud_stemcell)
            }
            Err(e) => {
                step.fail(failure_message(&e));
                stage.fail(failure_message(&e));
                Err(e)
            }
        }
    }

    async fn create_and_save(
        &self,
        stemcell: &ExtractedStemcell,
    ) -> Result<CloudStemcell, StemcellError> {
        let manifest = stemcell.manifest();
        let cid = self
            .cloud
            .create_stemcell(&manifest.image_path, &manifest.cloud_properties)
            .await?;
        self.repo.save(manifest, &cid)
    }
}
