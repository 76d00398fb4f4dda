//! Persistent key/value index keyed by a canonical encoding of structured keys.
//!
//! Keys are arbitrary `Serialize` records. Before lookup they are converted to
//! a `serde_json::Value` and re-encoded with object fields sorted, so two
//! logically-equal keys always map to the same entry regardless of struct
//! field order or map iteration order.

pub mod file;
pub mod memory;

pub use file::FileIndex;
pub use memory::InMemoryIndex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Writing index file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Reading index file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Index file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Marshalling index entry: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error("Index lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Raw storage contract. Implementors only see canonical key strings.
pub trait Index: Send + Sync {
    fn put(&self, canonical_key: String, value: Value) -> Result<()>;

    fn get(&self, canonical_key: &str) -> Result<Option<Value>>;
}

/// Typed access on top of any [`Index`].
pub trait IndexExt: Index {
    fn add<K: Serialize, V: Serialize>(&self, key: &K, value: &V) -> Result<()> {
        let key = canonical_key(key)?;
        let value = serde_json::to_value(value)?;
        self.put(key, value)
    }

    /// `Ok(None)` is a cache miss, not a failure.
    fn find<K: Serialize, V: DeserializeOwned>(&self, key: &K) -> Result<Option<V>> {
        let key = canonical_key(key)?;
        match self.get(&key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl<T: Index + ?Sized> IndexExt for T {}

/// Deterministic string form of a key.
pub fn canonical_key<K: Serialize>(key: &K) -> Result<String> {
    let value = canonicalize(serde_json::to_value(key)?);
    Ok(serde_json::to_string(&value)?)
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// SHA-256 hex digest of the canonical encoding of `value`.
pub fn fingerprint<K: Serialize>(value: &K) -> Result<String> {
    use sha2::{Digest, Sha256};
    let canonical = canonical_key(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
