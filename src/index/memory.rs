use super::{Index, IndexError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct InMemoryIndex {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Index for InMemoryIndex {
    fn put(&self, canonical_key: String, value: Value) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| IndexError::Poisoned)?;
        entries.insert(canonical_key, value);
        Ok(())
    }

    fn get(&self, canonical_key: &str) -> Result<Option<Value>> {
        let entries = self.entries.read().map_err(|_| IndexError::Poisoned)?;
        Ok(entries.get(canonical_key).cloned())
    }
}
