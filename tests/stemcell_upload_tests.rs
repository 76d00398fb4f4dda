//! Uploading stemcells through the cloud, recorded in deployment state.

use serde_json::json;
use solo_deploy::cloud::{CloudCall, FakeCloud};
use solo_deploy::config::{DeploymentStateService, FileDeploymentStateService};
use solo_deploy::eventlog::{EventState, RecordingEventLogger};
use solo_deploy::stemcell::{
    ExtractedStemcell, StateStemcellRepo, StemcellManager, StemcellManifest,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn fake_stemcell() -> ExtractedStemcell {
    ExtractedStemcell::new(StemcellManifest {
        name: "fake-stemcell-name".to_string(),
        version: "1".to_string(),
        sha1: "fake-sha1".to_string(),
        image_path: PathBuf::from("fake-image-path"),
        cloud_properties: json!({"fake-prop-key": "fake-prop-value"}),
        apply_spec: serde_json::Value::Null,
    })
}

fn manager(
    state: Arc<FileDeploymentStateService>,
    cloud: Arc<FakeCloud>,
    logger: Arc<RecordingEventLogger>,
) -> StemcellManager {
    StemcellManager::new(Arc::new(StateStemcellRepo::new(state)), cloud, logger)
}

#[tokio::test]
async fn test_new_stemcell_is_created_and_recorded() {
    let dir = TempDir::new().unwrap();
    let state = Arc::new(FileDeploymentStateService::new(dir.path().join("deployment.json")));
    let cloud = Arc::new(FakeCloud::new());
    let logger = Arc::new(RecordingEventLogger::new());
    let stemcell = fake_stemcell();

    let uploaded = manager(state.clone(), cloud.clone(), logger.clone())
        .upload(&stemcell)
        .await
        .unwrap();

    assert_eq!(
        cloud.calls(),
        vec![CloudCall::CreateStemcell {
            image_path: PathBuf::from("fake-image-path"),
            cloud_properties: json!({"fake-prop-key": "fake-prop-value"}),
        }]
    );

    let records = state.load().unwrap().stemcells;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].cid, uploaded.cid);
    assert_eq!(records[0].fingerprint, stemcell.manifest().fingerprint().unwrap());
    assert_eq!(
        logger.step_states("uploading stemcell", "Uploading"),
        vec![EventState::Started, EventState::Finished]
    );
}

#[tokio::test]
async fn test_recorded_stemcell_is_not_uploaded_again() {
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("deployment.json");
    let stemcell = fake_stemcell();

    let first_cloud = Arc::new(FakeCloud::new());
    let uploaded = manager(
        Arc::new(FileDeploymentStateService::new(&state_file)),
        first_cloud,
        Arc::new(RecordingEventLogger::new()),
    )
    .upload(&stemcell)
    .await
    .unwrap();

    // A later run reads the same state file.
    let cloud = Arc::new(FakeCloud::new());
    let logger = Arc::new(RecordingEventLogger::new());
    let again = manager(
        Arc::new(FileDeploymentStateService::new(&state_file)),
        cloud.clone(),
        logger.clone(),
    )
    .upload(&stemcell)
    .await
    .unwrap();

    assert_eq!(again, uploaded);
    assert!(cloud.calls().is_empty());
    assert_eq!(
        logger.step_states("uploading stemcell", "Uploading"),
        vec![EventState::Skipped]
    );
    assert_eq!(
        logger.step_message("uploading stemcell", "Uploading").as_deref(),
        Some("Stemcell already uploaded")
    );
}
