pub mod classify;
pub mod local_backend;
pub mod memory_backend;
pub mod registry;

use std::sync::Arc;

use keel_types::error::Result;

pub use classify::{classify_io, is_retryable_io};
pub use local_backend::LocalBackend;
pub use memory_backend::MemoryBackend;
pub use registry::{backend_from_url, parse_url, BackendFactory, BackendRegistry, ParsedUrl};

/// One object as reported by [`StorageBackend::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
}

/// Abstract remote storage holding flat, named volumes.
///
/// Failures are reported as `KeelError::Backend` carrying the backend's own
/// transient/fatal classification. Implementations never retry.
pub trait StorageBackend: Send + Sync {
    /// Read a volume. Returns `None` if it does not exist.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write a volume, replacing any existing one with the same name.
    fn put(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Delete a volume. Deleting a missing volume is not an error.
    fn delete(&self, name: &str) -> Result<()>;

    /// List every stored volume with its size.
    fn list(&self) -> Result<Vec<RemoteEntry>>;

    /// Short human label for log lines.
    fn label(&self) -> String {
        "backend".to_string()
    }
}

impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(name)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        (**self).put(name, data)
    }

    fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name)
    }

    fn list(&self) -> Result<Vec<RemoteEntry>> {
        (**self).list()
    }

    fn label(&self) -> String {
        (**self).label()
    }
}

impl<T: StorageBackend + ?Sized> StorageBackend for Box<T> {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(name)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        (**self).put(name, data)
    }

    fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name)
    }

    fn list(&self) -> Result<Vec<RemoteEntry>> {
        (**self).list()
    }

    fn label(&self) -> String {
        (**self).label()
    }
}
