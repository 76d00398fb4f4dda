//! Gzipped tarball helpers used for packages, jobs, releases and stemcells.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use tokio::task;
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archiving {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Walking {path}: {message}")]
    Walk { path: PathBuf, message: String },
    #[error("Archive task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Compress the contents of `src_dir` into a gzipped tarball at `dest`.
///
/// Entries are added in sorted path order with their paths relative to
/// `src_dir`, so the same tree always produces the same entry sequence.
pub async fn compress_dir(src_dir: &Path, dest: &Path) -> Result<()> {
    let src_dir = src_dir.to_path_buf();
    let dest = dest.to_path_buf();
    task::spawn_blocking(move || compress_dir_sync(&src_dir, &dest))
        .await
        .map_err(|e| ArchiveError::Join(e.to_string()))?
}

/// Extract a gzipped tarball into `dest_dir`, creating it if needed.
pub async fn extract(src: &Path, dest_dir: &Path) -> Result<()> {
    let src = src.to_path_buf();
    let dest_dir = dest_dir.to_path_buf();
    task::spawn_blocking(move || extract_sync(&src, &dest_dir))
        .await
        .map_err(|e| ArchiveError::Join(e.to_string()))?
}

fn compress_dir_sync(src_dir: &Path, dest: &Path) -> Result<()> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ArchiveError::Io { path, source }
    };

    let file = File::create(dest).map_err(io_err(dest))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(src_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| ArchiveError::Walk {
            path: src_dir.to_path_buf(),
            message: e.to_string(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| ArchiveError::Walk {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            })?;
        builder
            .append_path_with_name(entry.path(), relative)
            .map_err(io_err(entry.path()))?;
    }

    let encoder = builder.into_inner().map_err(io_err(dest))?;
    encoder.finish().map_err(io_err(dest))?;
    Ok(())
}

fn extract_sync(src: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(src).map_err(|source| ArchiveError::Io {
        path: src.to_path_buf(),
        source,
    })?;
    std::fs::create_dir_all(dest_dir).map_err(|source| ArchiveError::Io {
        path: dest_dir.to_path_buf(),
        source,
    })?;
    let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.unpack(dest_dir).map_err(|source| ArchiveError::Io {
        path: src.to_path_buf(),
        source,
    })
}
