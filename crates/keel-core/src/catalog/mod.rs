pub mod content;
pub mod fileset;
pub mod tables;
pub mod volume;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use keel_types::error::{KeelError, Result};
use tracing::{debug, warn};

use crate::config::CatalogConfig;

pub use self::content::ResolvedFile;
pub use self::tables::{
    BlockRow, BlocksetRow, ContentRef, ElementType, FileRow, FilesetRow, RemoteVolumeRow, Tables,
    CATALOG_VERSION,
};
pub use self::volume::{transition_allowed, VolumeRef};

/// Local metadata store: committed tables plus at most one open transaction.
///
/// Mutation requires `&mut Catalog`, so there is a single writer by
/// construction. The first mutation after a commit or rollback snapshots the
/// committed tables; `commit` publishes the snapshot, `rollback` drops it.
#[derive(Debug)]
pub struct Catalog {
    path: Option<PathBuf>,
    committed: Tables,
    pending: Option<Tables>,
}

impl Catalog {
    /// A catalog that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            committed: Tables::default(),
            pending: None,
        }
    }

    /// Open a file-backed catalog. A missing file yields an empty catalog.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let committed = match fs::read(&path) {
            Ok(data) => decode_tables(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no catalog file, starting empty");
                Tables::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            committed,
            pending: None,
        })
    }

    /// Open the catalog at the configured `catalog.path`.
    pub fn from_config(config: &CatalogConfig) -> Result<Self> {
        Self::open(&config.path)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current view: the open transaction if any, else committed state.
    pub fn tables(&self) -> &Tables {
        self.pending.as_ref().unwrap_or(&self.committed)
    }

    /// Last committed state, ignoring any open transaction.
    pub fn committed(&self) -> &Tables {
        &self.committed
    }

    /// Mutable access. Implicitly begins a transaction.
    pub(crate) fn tables_mut(&mut self) -> &mut Tables {
        let committed = &self.committed;
        self.pending.get_or_insert_with(|| committed.clone())
    }

    pub fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }

    /// Make the open transaction durable and visible. No-op without one.
    pub fn commit(&mut self, label: &str) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        if let Some(path) = &self.path {
            if let Err(e) = persist_tables(path, &pending) {
                warn!(label, error = %e, "catalog commit failed");
                self.pending = Some(pending);
                return Err(e);
            }
        }
        self.committed = pending;
        debug!(label, "catalog committed");
        Ok(())
    }

    /// Discard the open transaction.
    pub fn rollback(&mut self) {
        if self.pending.take().is_some() {
            debug!("catalog transaction rolled back");
        }
    }

    /// Run `f` and commit on success; on error roll back and return it.
    pub fn transaction<T>(
        &mut self,
        label: &str,
        f: impl FnOnce(&mut Catalog) -> Result<T>,
    ) -> Result<T> {
        match f(self) {
            Ok(value) => {
                self.commit(label)?;
                Ok(value)
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }
}

fn decode_tables(data: &[u8]) -> Result<Tables> {
    let mut tables: Tables =
        rmp_serde::from_slice(data).map_err(|e| KeelError::deserialization("catalog", e, data))?;
    if tables.version != CATALOG_VERSION {
        return Err(KeelError::UnsupportedVersion {
            what: "catalog",
            version: tables.version,
        });
    }
    tables.rebuild_indexes();
    Ok(tables)
}

/// Write to a temp file next to `path`, fsync, then rename into place.
fn persist_tables(path: &Path, tables: &Tables) -> Result<()> {
    let bytes = rmp_serde::to_vec_named(tables)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
