use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use keel_types::error::Result;

use crate::{RemoteEntry, StorageBackend};

/// In-process backend keyed by volume name. Thread-safe via Mutex.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.data
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of stored volumes.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map().contains_key(name)
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map().get(name).cloned())
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.map().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.map().remove(name);
        Ok(())
    }

    fn list(&self) -> Result<Vec<RemoteEntry>> {
        Ok(self
            .map()
            .iter()
            .map(|(name, data)| RemoteEntry {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn label(&self) -> String {
        "memory://".to_string()
    }
}
