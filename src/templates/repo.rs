use super::RenderContext;
use crate::blobstore::BlobRef;
use crate::index::{fingerprint, Index, IndexError, IndexExt};
use crate::release::Job;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub blob: BlobRef,
}

#[derive(Serialize)]
struct TemplateKey<'a> {
    job: &'a str,
    fingerprint: &'a str,
    packages: Vec<&'a str>,
    context_fingerprint: String,
}

pub trait TemplatesRepo: Send + Sync {
    fn save(
        &self,
        job: &Job,
        context: &RenderContext,
        record: &TemplateRecord,
    ) -> Result<(), IndexError>;

    fn find(&self, job: &Job, context: &RenderContext)
        -> Result<Option<TemplateRecord>, IndexError>;
}

pub struct IndexTemplatesRepo {
    index: Arc<dyn Index>,
}

impl IndexTemplatesRepo {
    pub fn new(index: Arc<dyn Index>) -> Self {
        Self { index }
    }
}

impl TemplatesRepo for IndexTemplatesRepo {
    fn save(
        &self,
        job: &Job,
        context: &RenderContext,
        record: &TemplateRecord,
    ) -> Result<(), IndexError> {
        self.index.add(&key(job, context)?, record)
    }

    fn find(
        &self,
        job: &Job,
        context: &RenderContext,
    ) -> Result<Option<TemplateRecord>, IndexError> {
        self.index.find(&key(job, context)?)
    }
}

fn key<'a>(job: &'a Job, context: &RenderContext) -> Result<TemplateKey<'a>, IndexError> {
    let mut packages: Vec<&str> = job.packages.iter().map(String::as_str).collect();
    packages.sort_unstable();
    Ok(TemplateKey {
        job: &job.name,
        fingerprint: &job.fingerprint,
        packages,
        context_fingerprint: fingerprint(context)?,
    })
}
