use super::{
    render_context, JobRenderer, RenderContext, TemplateRecord, TemplatesError, TemplatesRepo,
};
use crate::archive;
use crate::blobstore::Blobstore;
use crate::eventlog::{failure_message, EventLogger, Stage};
use crate::release::Job;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Renders and archives job templates, skipping jobs whose rendered output
/// for the same properties is already recorded.
///
/// Jobs are independent of each other, so processing order does not matter.
pub struct TemplatesCompiler {
    renderer: Arc<dyn JobRenderer>,
    blobstore: Arc<dyn Blobstore>,
    repo: Arc<dyn TemplatesRepo>,
    event_logger: Arc<dyn EventLogger>,
}

impl TemplatesCompiler {
    pub fn new(
        renderer: Arc<dyn JobRenderer>,
        blobstore: Arc<dyn Blobstore>,
        repo: Arc<dyn TemplatesRepo>,
        event_logger: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            renderer,
            blobstore,
            repo,
            event_logger,
        }
    }

    pub async fn compile(
        &self,
        jobs: &[Job],
        deployment_name: &str,
        properties: &Value,
    ) -> Result<BTreeMap<String, TemplateRecord>, TemplatesError> {
        let stage = Stage::new(self.event_logger.clone(), "rendering job templates");
        stage.start();

        let mut records = BTreeMap::new();
        for job in jobs {
            let step = stage.new_step(job.name.clone());
            let context = render_context(job, deployment_name, properties);

            let found = self
                .repo
                .find(job, &context)
                .map_err(|source| TemplatesError::Cache {
                    operation: format!("Finding rendered templates for job '{}'", job.name),
                    source,
                });
            let result = match found {
                Ok(Some(record)) => {
                    step.skip("Job templates already rendered");
                    Ok(record)
                }
                Ok(None) => {
                    step.start();
                    let rendered = self.render_and_save(job, &context).await;
                    if rendered.is_ok() {
                        step.finish();
                    }
                    rendered
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(record) => {
                    records.insert(job.name.clone(), record);
                }
                Err(e) => {
                    step.fail(failure_message(&e));
                    stage.fail(failure_message(&e));
                    return Err(e);
                }
            }
        }

        stage.finish();
        Ok(records)
    }

    async fn render_and_save(
        &self,
        job: &Job,
        context: &RenderContext,
    ) -> Result<TemplateRecord, TemplatesError> {
        let workspace = tempfile::TempDir::new().map_err(|source| TemplatesError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
        let rendered_dir = workspace.path().join("rendered");
        std::fs::create_dir_all(&rendered_dir).map_err(|source| TemplatesError::Io {
            path: rendered_dir.clone(),
            source,
        })?;

        self.renderer.render(job, context, &rendered_dir)?;

        let tarball = workspace.path().join("rendered.tgz");
        archive::compress_dir(&rendered_dir, &tarball).await?;
        let record = TemplateRecord {
            blob: self.blobstore.create(&tarball)?,
        };

        self.repo
            .save(job, context, &record)
            .map_err(|source| TemplatesError::Cache {
                operation: format!("Saving rendered templates for job '{}'", job.name),
                source,
            })?;

        info!("Rendered templates for job {} into blob {}", job.name, record.blob.blob_id);
        Ok(record)
    }
}
