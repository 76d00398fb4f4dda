use super::{Index, IndexError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// JSON-file backed index. The whole table is rewritten on every `put`.
pub struct FileIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    key: String,
    value: Value,
}

impl FileIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<IndexFile> {
        if !self.path.exists() {
            return Ok(IndexFile::default());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| IndexError::Read {
            path: self.path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(IndexFile::default());
        }
        serde_json::from_str(&content).map_err(|source| IndexError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, file: &IndexFile) -> Result<()> {
        let write_err = |source| IndexError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(file)?;
        std::fs::write(&self.path, json).map_err(write_err)
    }
}

impl Index for FileIndex {
    fn put(&self, canonical_key: String, value: Value) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| IndexError::Poisoned)?;
        let mut file = self.load()?;
        match file.entries.iter_mut().find(|e| e.key == canonical_key) {
            Some(entry) => entry.value = value,
            None => file.entries.push(IndexEntry {
                key: canonical_key,
                value,
            }),
        }
        debug!("Writing {} index entries to {:?}", file.entries.len(), self.path);
        self.store(&file)
    }

    fn get(&self, canonical_key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().map_err(|_| IndexError::Poisoned)?;
        let file = self.load()?;
        Ok(file
            .entries
            .into_iter()
            .find(|e| e.key == canonical_key)
            .map(|e| e.value))
    }
}
