use crate::config::{ConfigError, DeploymentStateService};
use crate::stemcell::CloudStemcell;
use std::sync::Arc;

/// What the last successful deploy converged to.
pub struct DeploymentRecord {
    state: Arc<dyn DeploymentStateService>,
}

impl DeploymentRecord {
    pub fn new(state: Arc<dyn DeploymentStateService>) -> Self {
        Self { state }
    }

    /// True when the last successful deploy used exactly this manifest,
    /// release and stemcell.
    pub fn is_deployed(
        &self,
        manifest_digest: &str,
        release_digest: &str,
        stemcell: &CloudStemcell,
    ) -> Result<bool, ConfigError> {
        let state = self.state.load()?;
        Ok(state.current_manifest_digest.as_deref() == Some(manifest_digest)
            && state.current_release_digest.as_deref() == Some(release_digest)
            && state.current_stemcell_id.as_deref() == Some(stemcell.id.as_str()))
    }

    pub fn update(
        &self,
        manifest_digest: &str,
        release_digest: &str,
        stemcell: &CloudStemcell,
    ) -> Result<(), ConfigError> {
        self.state.update(&mut |state| {
            state.current_manifest_digest = Some(manifest_digest.to_string());
            state.current_release_digest = Some(release_digest.to_string());
            state.current_stemcell_id = Some(stemcell.id.clone());
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryDeploymentStateService;

    fn stemcell(id: &str) -> CloudStemcell {
        CloudStemcell {
            id: id.to_string(),
            name: "ubuntu".to_string(),
            version: "1".to_string(),
            cid: format!("cid-{id}"),
        }
    }

    #[test]
    fn test_deployed_only_after_update_with_same_inputs() {
        let record = DeploymentRecord::new(Arc::new(InMemoryDeploymentStateService::new()));
        assert!(!record.is_deployed("m", "r", &stemcell("s1")).unwrap());

        record.update("m", "r", &stemcell("s1")).unwrap();

        assert!(record.is_deployed("m", "r", &stemcell("s1")).unwrap());
        assert!(!record.is_deployed("m2", "r", &stemcell("s1")).unwrap());
        assert!(!record.is_deployed("m", "r2", &stemcell("s1")).unwrap());
        assert!(!record.is_deployed("m", "r", &stemcell("s2")).unwrap());
    }
}
