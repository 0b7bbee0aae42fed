use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use keel_storage::{MemoryBackend, RemoteEntry, StorageBackend};
use keel_types::block_hash::BlockHash;
use keel_types::error::{BackendErrorKind, KeelError, Result};
use keel_types::ids::{FileId, FilesetId, VolumeId};
use keel_types::volume::{VolumeState, VolumeType};

use crate::catalog::{Catalog, ContentRef};
use crate::config::BackupConfig;
use crate::filelist::filelist_name;

/// Shared log of mutating backend calls.
pub type PutLog = Arc<Mutex<Vec<String>>>;

/// Memory backend that records the names passed to `put` and `delete`.
pub struct RecordingBackend {
    inner: MemoryBackend,
    puts: PutLog,
    deletes: PutLog,
}

impl RecordingBackend {
    pub fn new() -> (Self, PutLog, PutLog) {
        let puts: PutLog = Arc::new(Mutex::new(Vec::new()));
        let deletes: PutLog = Arc::new(Mutex::new(Vec::new()));
        let backend = Self {
            inner: MemoryBackend::new(),
            puts: Arc::clone(&puts),
            deletes: Arc::clone(&deletes),
        };
        (backend, puts, deletes)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains(name)
    }
}

impl StorageBackend for RecordingBackend {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(name)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        self.puts.lock().unwrap().push(name.to_string());
        self.inner.put(name, data)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.deletes.lock().unwrap().push(name.to_string());
        self.inner.delete(name)
    }

    fn list(&self) -> Result<Vec<RemoteEntry>> {
        self.inner.list()
    }
}

/// Memory backend whose `put`, `delete` and `list` can be made to fail.
#[derive(Default)]
pub struct FailingBackend {
    pub inner: MemoryBackend,
    fail_put: Mutex<Option<BackendErrorKind>>,
    fail_delete: Mutex<Option<BackendErrorKind>>,
    fail_list: Mutex<Option<BackendErrorKind>>,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, kind: Option<BackendErrorKind>) {
        *self.fail_put.lock().unwrap() = kind;
    }

    pub fn fail_deletes(&self, kind: Option<BackendErrorKind>) {
        *self.fail_delete.lock().unwrap() = kind;
    }

    pub fn fail_lists(&self, kind: Option<BackendErrorKind>) {
        *self.fail_list.lock().unwrap() = kind;
    }
}

impl StorageBackend for FailingBackend {
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(name)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<()> {
        if let Some(kind) = *self.fail_put.lock().unwrap() {
            return Err(KeelError::backend(kind, "put", name, "injected failure"));
        }
        self.inner.put(name, data)
    }

    fn delete(&self, name: &str) -> Result<()> {
        if let Some(kind) = *self.fail_delete.lock().unwrap() {
            return Err(KeelError::backend(kind, "delete", name, "injected failure"));
        }
        self.inner.delete(name)
    }

    fn list(&self) -> Result<Vec<RemoteEntry>> {
        if let Some(kind) = *self.fail_list.lock().unwrap() {
            return Err(KeelError::backend(kind, "list", "", "injected failure"));
        }
        self.inner.list()
    }
}

/// Small blocks and volumes so tests exercise splitting and sealing.
pub fn small_config() -> BackupConfig {
    BackupConfig {
        block_size: 4,
        volume_size: 16,
        upload_concurrency: 2,
        ..BackupConfig::default()
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Record `path` with `content` split into 4-byte blocks.
pub fn record_content(catalog: &mut Catalog, path: &str, content: &[u8]) -> FileId {
    let mut ids = Vec::new();
    for chunk in content.chunks(4) {
        let hash = BlockHash::compute(chunk);
        ids.push(
            catalog
                .lookup_or_create_block(hash, chunk.len() as u64)
                .unwrap(),
        );
    }
    let content_id = catalog.create_blockset(&ids).unwrap();
    let metadata_id = metadata_blockset(catalog, path);
    catalog
        .record_file(path, ContentRef::Blockset(content_id), metadata_id)
        .unwrap()
}

pub fn record_folder(catalog: &mut Catalog, path: &str) -> FileId {
    let metadata_id = metadata_blockset(catalog, path);
    catalog
        .record_file(path, ContentRef::Folder, metadata_id)
        .unwrap()
}

fn metadata_blockset(catalog: &mut Catalog, seed: &str) -> keel_types::ids::BlocksetId {
    let bytes = format!("meta:{seed}");
    let hash = BlockHash::compute(bytes.as_bytes());
    let block = catalog
        .lookup_or_create_block(hash, bytes.len() as u64)
        .unwrap();
    catalog.create_blockset(&[block]).unwrap()
}

/// Fileset at `at(secs)` with a Files volume, holding `entries`. The volume
/// is left in `state`; the fileset is sealed when `seal` is set.
pub fn fileset_with(
    catalog: &mut Catalog,
    secs: i64,
    entries: &[(&str, &[u8])],
    state: VolumeState,
    seal: bool,
) -> (FilesetId, VolumeId) {
    let ts = at(secs);
    let volume = catalog
        .register_volume(&filelist_name(ts), VolumeType::Files)
        .unwrap();
    let fileset = catalog.create_fileset(ts);
    catalog.link_fileset_to_volume(fileset, volume).unwrap();
    for (path, content) in entries {
        let file = record_content(catalog, path, content);
        catalog.add_entry(fileset, file).unwrap();
    }
    if seal {
        catalog.seal_fileset(fileset).unwrap();
    }
    let path: &[VolumeState] = match state {
        VolumeState::Temporary => &[],
        VolumeState::Uploading => &[VolumeState::Uploading],
        VolumeState::Uploaded => &[VolumeState::Uploading, VolumeState::Uploaded],
        VolumeState::Verified => &[
            VolumeState::Uploading,
            VolumeState::Uploaded,
            VolumeState::Verified,
        ],
        other => panic!("fixture does not drive volumes to {other}"),
    };
    for next in path {
        catalog.update_volume_state(volume, *next, None, None).unwrap();
    }
    catalog.commit("fixture").unwrap();
    (fileset, volume)
}

/// Paths of a fileset, in order.
pub fn paths_of(catalog: &Catalog, fileset: FilesetId) -> Vec<String> {
    catalog
        .fileset_entries(fileset)
        .unwrap()
        .keys()
        .cloned()
        .collect()
}
