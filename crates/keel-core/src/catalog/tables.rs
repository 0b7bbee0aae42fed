use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use keel_types::block_hash::BlockHash;
use keel_types::ids::{BlockId, BlocksetId, FileId, FilesetId, VolumeId};
use keel_types::volume::{VolumeState, VolumeType};
use serde::{Deserialize, Serialize};

/// Current on-disk catalog schema version.
pub const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRow {
    pub id: BlockId,
    pub hash: BlockHash,
    pub size: u64,
    /// Blocks volume currently holding this block's bytes.
    pub volume_id: Option<VolumeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksetRow {
    pub id: BlocksetId,
    /// Combined hash of the ordered block hashes.
    pub full_hash: BlockHash,
    pub length: u64,
    pub blocks: Vec<BlockId>,
}

/// What a file's content column points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentRef {
    Blockset(BlocksetId),
    Folder,
    Symlink,
}

impl ContentRef {
    pub fn element_type(&self) -> ElementType {
        match self {
            ContentRef::Blockset(_) => ElementType::File,
            ContentRef::Folder => ElementType::Folder,
            ContentRef::Symlink => ElementType::Symlink,
        }
    }

    pub fn blockset(&self) -> Option<BlocksetId> {
        match self {
            ContentRef::Blockset(id) => Some(*id),
            ContentRef::Folder | ContentRef::Symlink => None,
        }
    }
}

/// Kind of a filesystem entry. Ordered as reports list them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Folder,
    Symlink,
    File,
}

impl ElementType {
    pub const ALL: [ElementType; 3] = [ElementType::Folder, ElementType::Symlink, ElementType::File];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Folder => "folder",
            ElementType::Symlink => "symlink",
            ElementType::File => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRow {
    pub id: FileId,
    pub path: String,
    pub content: ContentRef,
    pub metadata: BlocksetId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetRow {
    pub id: FilesetId,
    pub timestamp: DateTime<Utc>,
    /// Files-type volume carrying this fileset's filelist.
    pub volume_id: Option<VolumeId>,
    pub sealed: bool,
    /// Set for synthetic or otherwise incomplete runs.
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVolumeRow {
    pub id: VolumeId,
    pub name: String,
    pub kind: VolumeType,
    pub state: VolumeState,
    pub size: Option<u64>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct IdCounters {
    pub block: u64,
    pub blockset: u64,
    pub file: u64,
    pub fileset: u64,
    pub volume: u64,
}

impl IdCounters {
    fn bump(counter: &mut u64) -> u64 {
        *counter += 1;
        *counter
    }
}

/// All catalog rows plus derived lookup indexes.
///
/// Indexes are not persisted; [`Tables::rebuild_indexes`] recomputes them
/// after decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tables {
    pub(crate) version: u32,
    pub(crate) blocks: BTreeMap<BlockId, BlockRow>,
    pub(crate) blocksets: BTreeMap<BlocksetId, BlocksetRow>,
    pub(crate) files: BTreeMap<FileId, FileRow>,
    pub(crate) filesets: BTreeMap<FilesetId, FilesetRow>,
    /// Visible file version per path, per fileset.
    pub(crate) fileset_entries: BTreeMap<FilesetId, BTreeMap<String, FileId>>,
    pub(crate) volumes: BTreeMap<VolumeId, RemoteVolumeRow>,
    pub(crate) next_ids: IdCounters,

    #[serde(skip)]
    pub(crate) block_by_hash: HashMap<BlockHash, BlockId>,
    #[serde(skip)]
    pub(crate) blockset_by_hash: HashMap<BlockHash, BlocksetId>,
    #[serde(skip)]
    pub(crate) file_by_key: HashMap<(String, ContentRef, BlocksetId), FileId>,
    #[serde(skip)]
    pub(crate) volume_by_name: HashMap<String, VolumeId>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            version: CATALOG_VERSION,
            blocks: BTreeMap::new(),
            blocksets: BTreeMap::new(),
            files: BTreeMap::new(),
            filesets: BTreeMap::new(),
            fileset_entries: BTreeMap::new(),
            volumes: BTreeMap::new(),
            next_ids: IdCounters::default(),
            block_by_hash: HashMap::new(),
            blockset_by_hash: HashMap::new(),
            file_by_key: HashMap::new(),
            volume_by_name: HashMap::new(),
        }
    }
}

impl Tables {
    pub(crate) fn rebuild_indexes(&mut self) {
        self.block_by_hash = self.blocks.values().map(|b| (b.hash, b.id)).collect();
        self.blockset_by_hash = self
            .blocksets
            .values()
            .map(|bs| (bs.full_hash, bs.id))
            .collect();
        self.file_by_key = self
            .files
            .values()
            .map(|f| ((f.path.clone(), f.content, f.metadata), f.id))
            .collect();
        self.volume_by_name = self
            .volumes
            .values()
            .map(|v| (v.name.clone(), v.id))
            .collect();
    }

    pub(crate) fn next_block_id(&mut self) -> BlockId {
        BlockId(IdCounters::bump(&mut self.next_ids.block))
    }

    pub(crate) fn next_blockset_id(&mut self) -> BlocksetId {
        BlocksetId(IdCounters::bump(&mut self.next_ids.blockset))
    }

    pub(crate) fn next_file_id(&mut self) -> FileId {
        FileId(IdCounters::bump(&mut self.next_ids.file))
    }

    pub(crate) fn next_fileset_id(&mut self) -> FilesetId {
        FilesetId(IdCounters::bump(&mut self.next_ids.fileset))
    }

    pub(crate) fn next_volume_id(&mut self) -> VolumeId {
        VolumeId(IdCounters::bump(&mut self.next_ids.volume))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blockset_count(&self) -> usize {
        self.blocksets.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn filesets(&self) -> impl Iterator<Item = &FilesetRow> {
        self.filesets.values()
    }

    pub fn volumes(&self) -> impl Iterator<Item = &RemoteVolumeRow> {
        self.volumes.values()
    }
}
