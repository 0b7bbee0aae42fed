//! Filelist volumes: the serialized description of one fileset.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, DurationRound, Utc};
use keel_types::block_hash::BlockHash;
use keel_types::error::{KeelError, Result};
use keel_types::ids::{FilesetId, VolumeId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{Catalog, ElementType};

pub const FILELIST_VERSION: u32 = 1;

const FILELIST_PREFIX: &str = "keel-";
const FILELIST_SUFFIX: &str = ".dlist";
const NAME_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilelistEntry {
    pub path: String,
    pub element_type: ElementType,
    /// `None` for folders and symlinks.
    pub content_hash: Option<BlockHash>,
    pub size: u64,
    pub metadata_hash: BlockHash,
    pub blocks: Vec<BlockHash>,
    pub metadata_blocks: Vec<BlockHash>,
}

/// Opaque user file carried alongside the entries, restored verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFile {
    pub name: String,
    pub data: Vec<u8>,
}

impl ControlFile {
    /// Read `path`, naming the control file after its last component.
    pub fn load(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                KeelError::Config(format!("control file '{}' has no file name", path.display()))
            })?;
        let data = fs::read(path)?;
        Ok(Self { name, data })
    }
}

/// Load every configured control file, in order.
pub fn load_control_files(paths: &[PathBuf]) -> Result<Vec<ControlFile>> {
    paths.iter().map(|p| ControlFile::load(p)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilelistDocument {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub partial: bool,
    pub entries: Vec<FilelistEntry>,
    #[serde(default)]
    pub control_files: Vec<ControlFile>,
}

/// Remote name of the filelist for a fileset taken at `timestamp`.
pub fn filelist_name(timestamp: DateTime<Utc>) -> String {
    format!(
        "{FILELIST_PREFIX}{}{FILELIST_SUFFIX}",
        timestamp.format(NAME_TIME_FORMAT)
    )
}

fn truncate_to_second(time: DateTime<Utc>) -> DateTime<Utc> {
    time.duration_trunc(Duration::seconds(1)).unwrap_or(time)
}

/// First whole-second time at or after `time` that no fileset uses and whose
/// filelist name is not registered.
pub fn probe_unused_filename(catalog: &Catalog, time: DateTime<Utc>) -> DateTime<Utc> {
    let tables = catalog.tables();
    let mut candidate = truncate_to_second(time);
    loop {
        let taken = tables.filesets().any(|fs| fs.timestamp == candidate)
            || catalog.volume(filelist_name(candidate).as_str()).is_ok();
        if !taken {
            return candidate;
        }
        candidate += Duration::seconds(1);
    }
}

/// Finished filelist bytes ready for upload.
#[derive(Debug, Clone)]
pub struct ClosedFilelist {
    pub name: String,
    pub bytes: Vec<u8>,
    pub hash: String,
}

impl ClosedFilelist {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Builds one filelist volume. Dropping an unclosed writer discards it.
#[derive(Debug)]
pub struct FilelistWriter {
    remote_name: String,
    timestamp: DateTime<Utc>,
    partial: Option<bool>,
    entries: Vec<FilelistEntry>,
    control_files: Vec<ControlFile>,
    pub volume_id: Option<VolumeId>,
}

impl FilelistWriter {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        let timestamp = truncate_to_second(timestamp);
        Self {
            remote_name: filelist_name(timestamp),
            timestamp,
            partial: None,
            entries: Vec::new(),
            control_files: Vec::new(),
            volume_id: None,
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Record whether this filelist describes a complete run.
    pub fn create_fileset_file(&mut self, is_full_backup: bool) {
        self.partial = Some(!is_full_backup);
    }

    /// Later files with the same name replace earlier ones.
    pub fn add_control_file(&mut self, file: ControlFile) {
        self.control_files.retain(|f| f.name != file.name);
        self.control_files.push(file);
    }

    /// Append every entry of `fileset_id` with its block lists.
    pub fn write_fileset(&mut self, catalog: &Catalog, fileset_id: FilesetId) -> Result<usize> {
        let entries = catalog.fileset_entries(fileset_id)?;
        self.entries.reserve(entries.len());
        for file_id in entries.values() {
            let resolved = catalog.resolve_file(*file_id)?;
            let (content_hash, size, blocks) = match resolved.content {
                Some(bs) => (Some(bs.full_hash), bs.length, catalog.blockset_hashes(bs.id)?),
                None => (None, 0, Vec::new()),
            };
            self.entries.push(FilelistEntry {
                path: resolved.file.path.clone(),
                element_type: resolved.file.content.element_type(),
                content_hash,
                size,
                metadata_hash: resolved.metadata.full_hash,
                blocks,
                metadata_blocks: catalog.blockset_hashes(resolved.metadata.id)?,
            });
        }
        Ok(entries.len())
    }

    /// Serialize the document and compute its hash.
    pub fn close(self) -> Result<ClosedFilelist> {
        let partial = self
            .partial
            .ok_or(KeelError::MissingParameter("fileset kind (full or partial)"))?;
        let document = FilelistDocument {
            version: FILELIST_VERSION,
            timestamp: self.timestamp,
            partial,
            entries: self.entries,
            control_files: self.control_files,
        };
        let bytes = rmp_serde::to_vec_named(&document)?;
        let hash = BlockHash::compute(&bytes).to_hex();
        debug!(
            volume = %self.remote_name,
            entries = document.entries.len(),
            control_files = document.control_files.len(),
            bytes = bytes.len(),
            partial,
            "closed filelist"
        );
        Ok(ClosedFilelist {
            name: self.remote_name,
            bytes,
            hash,
        })
    }
}

/// Decode filelist volume bytes.
pub fn decode_filelist(data: &[u8]) -> Result<FilelistDocument> {
    let document: FilelistDocument =
        rmp_serde::from_slice(data).map_err(|e| KeelError::deserialization("filelist", e, data))?;
    if document.version != FILELIST_VERSION {
        return Err(KeelError::UnsupportedVersion {
            what: "filelist",
            version: document.version,
        });
    }
    Ok(document)
}
