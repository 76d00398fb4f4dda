use super::{CloudStemcell, StemcellError, StemcellManifest};
use crate::config::{DeploymentStateService, StemcellRecord};
use std::sync::Arc;
use uuid::Uuid;

/// Uploaded stemcells of this deployment, keyed by manifest fingerprint.
pub trait StemcellRepo: Send + Sync {
    fn save(&self, manifest: &StemcellManifest, cid: &str)
        -> Result<CloudStemcell, StemcellError>;

    fn find(&self, manifest: &StemcellManifest) -> Result<Option<CloudStemcell>, StemcellError>;
}

/// Stores stemcell records in the deployment state file.
pub struct StateStemcellRepo {
    state: Arc<dyn DeploymentStateService>,
}

impl StateStemcellRepo {
    pub fn new(state: Arc<dyn DeploymentStateService>) -> Self {
        Self { state }
    }
}

fn to_cloud_stemcell(record: &StemcellRecord) -> CloudStemcell {
    CloudStemcell {
        id: record.id.clone(),
        name: record.name.clone(),
        version: record.version.clone(),
        cid: record.cid.clone(),
    }
}

impl StemcellRepo for StateStemcellRepo {
    fn save(
        &self,
        manifest: &StemcellManifest,
        cid: &str,
    ) -> Result<CloudStemcell, StemcellError> {
        let record = StemcellRecord {
            id: Uuid::new_v4().to_string(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            cid: cid.to_string(),
            fingerprint: manifest.fingerprint()?,
        };
        let saved = record.clone();
        self.state.update(&mut |state| {
            state.stemcells.retain(|s| s.fingerprint != saved.fingerprint);
            state.stemcells.push(saved.clone());
        })?;
        Ok(to_cloud_stemcell(&record))
    }

    fn find(&self, manifest: &StemcellManifest) -> Result<Option<CloudStemcell>, StemcellError> {
        let fingerprint = manifest.fingerprint()?;
        let state = self.state.load()?;
        Ok(state
            .stemcells
            .iter()
            .find(|s| s.fingerprint == fingerprint)
            .map(to_cloud_stemcell))
    }
}
