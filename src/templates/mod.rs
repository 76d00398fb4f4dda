//! Rendering job templates into archives, cached per job and property set.

pub mod compiler;
pub mod renderer;
pub mod repo;

pub use compiler::TemplatesCompiler;
pub use renderer::{render_context, HandlebarsJobRenderer, JobRenderer, RenderContext};
pub use repo::{IndexTemplatesRepo, TemplateRecord, TemplatesRepo};

use crate::archive::ArchiveError;
use crate::blobstore::BlobstoreError;
use crate::index::IndexError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplatesError {
    #[error("Rendering template '{template}' of job '{job}': {message}")]
    Render {
        job: String,
        template: String,
        message: String,
    },

    #[error("Writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation}: {source}")]
    Cache {
        operation: String,
        #[source]
        source: IndexError,
    },

    #[error("Blobstore error: {0}")]
    Blobstore(#[from] BlobstoreError),

    #[error("Archiving rendered job: {0}")]
    Archive(#[from] ArchiveError),
}
