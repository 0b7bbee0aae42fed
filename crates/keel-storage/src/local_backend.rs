use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use keel_types::error::{BackendErrorKind, KeelError, Result};
use tracing::debug;

use crate::classify::classify_io;
use crate::{RemoteEntry, StorageBackend};

/// Volumes stored as plain files in one flat directory.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root_path = root.as_ref().to_path_buf();
        let label = root_path.display().to_string();
        fs::create_dir_all(&root_path).map_err(|e| classify_io("open", &label, e))?;
        let root = fs::canonicalize(&root_path).map_err(|e| classify_io("open", &label, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Volume names are flat: no separators, no traversal, no hidden files.
    fn validate_name(name: &str) -> Result<()> {
        let reason = if name.is_empty() {
            Some("empty")
        } else if name.contains('/') || name.contains('\\') {
            Some("contains a path separator")
        } else if name.starts_with('.') {
            Some("starts with '.'")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(KeelError::backend(
                BackendErrorKind::Fatal,
                "validate",
                name,
                format!("unsafe volume name: {reason}"),
            )),
            None => Ok(()),
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// Write to a temp file in the same directory, then rename into place.
    fn atomic_write(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(classify_io("get", name, e)),
        }
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(name)?;
        self.atomic_write(&path, data)
            .map_err(|e| classify_io("put", name, e))?;
        debug!(volume = name, bytes = data.len(), "stored volume");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify_io("delete", name, e)),
        }
    }

    fn list(&self) -> Result<Vec<RemoteEntry>> {
        let root = self.root.display().to_string();
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| classify_io("list", &root, e))? {
            let entry = entry.map_err(|e| classify_io("list", &root, e))?;
            let meta = entry
                .metadata()
                .map_err(|e| classify_io("list", &root, e))?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            // In-flight temp files from atomic_write.
            if name.starts_with('.') {
                continue;
            }
            entries.push(RemoteEntry {
                name,
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn label(&self) -> String {
        format!("file://{}", self.root.display())
    }
}
