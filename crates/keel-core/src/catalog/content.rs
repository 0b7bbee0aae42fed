use keel_types::block_hash::BlockHash;
use keel_types::error::{KeelError, Result};
use keel_types::ids::{BlockId, BlocksetId, FileId, VolumeId};
use tracing::trace;

use super::tables::{BlockRow, BlocksetRow, ContentRef, FileRow};
use super::Catalog;

/// A file row with its blocksets looked up.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedFile<'a> {
    pub file: &'a FileRow,
    /// `None` for folders and symlinks.
    pub content: Option<&'a BlocksetRow>,
    pub metadata: &'a BlocksetRow,
}

impl Catalog {
    /// Return the id of the block with `hash`, creating it if absent.
    ///
    /// A known hash with a different size is a data-integrity error.
    pub fn lookup_or_create_block(&mut self, hash: BlockHash, size: u64) -> Result<BlockId> {
        if let Some(existing) = self.find_block(&hash) {
            if existing.size != size {
                return Err(KeelError::BlockSizeMismatch {
                    hash: hash.to_hex(),
                    existing: existing.size,
                    given: size,
                });
            }
            return Ok(existing.id);
        }
        let tables = self.tables_mut();
        let id = tables.next_block_id();
        tables.blocks.insert(
            id,
            BlockRow {
                id,
                hash,
                size,
                volume_id: None,
            },
        );
        tables.block_by_hash.insert(hash, id);
        trace!(block = %hash, size, "new block");
        Ok(id)
    }

    pub fn find_block(&self, hash: &BlockHash) -> Option<&BlockRow> {
        let tables = self.tables();
        tables
            .block_by_hash
            .get(hash)
            .and_then(|id| tables.blocks.get(id))
    }

    pub fn block(&self, id: BlockId) -> Result<&BlockRow> {
        self.tables()
            .blocks
            .get(&id)
            .ok_or_else(|| KeelError::BlockNotFound(id.to_string()))
    }

    /// Record which Blocks volume holds a block's bytes.
    pub fn assign_block_volume(&mut self, id: BlockId, volume: VolumeId) -> Result<()> {
        let row = self
            .tables_mut()
            .blocks
            .get_mut(&id)
            .ok_or_else(|| KeelError::BlockNotFound(id.to_string()))?;
        row.volume_id = Some(volume);
        Ok(())
    }

    /// Create (or find) the blockset for an ordered list of blocks.
    ///
    /// Identity is the combined hash of the ordered block hashes, so equal
    /// content always maps to the same blockset.
    pub fn create_blockset(&mut self, blocks: &[BlockId]) -> Result<BlocksetId> {
        let mut hashes = Vec::with_capacity(blocks.len());
        let mut length = 0u64;
        for id in blocks {
            let row = self.block(*id)?;
            hashes.push(row.hash);
            length += row.size;
        }
        let full_hash = BlockHash::combine(&hashes);
        if let Some(id) = self.tables().blockset_by_hash.get(&full_hash) {
            return Ok(*id);
        }
        let tables = self.tables_mut();
        let id = tables.next_blockset_id();
        tables.blocksets.insert(
            id,
            BlocksetRow {
                id,
                full_hash,
                length,
                blocks: blocks.to_vec(),
            },
        );
        tables.blockset_by_hash.insert(full_hash, id);
        Ok(id)
    }

    pub fn blockset(&self, id: BlocksetId) -> Result<&BlocksetRow> {
        self.tables()
            .blocksets
            .get(&id)
            .ok_or(KeelError::BlocksetNotFound(id))
    }

    /// Record one version of `path`. An identical existing version is reused.
    pub fn record_file(
        &mut self,
        path: &str,
        content: ContentRef,
        metadata: BlocksetId,
    ) -> Result<FileId> {
        if path.is_empty() {
            return Err(KeelError::MissingParameter("path"));
        }
        if let Some(content_id) = content.blockset() {
            self.blockset(content_id)?;
        }
        self.blockset(metadata)?;

        let key = (path.to_string(), content, metadata);
        if let Some(id) = self.tables().file_by_key.get(&key) {
            return Ok(*id);
        }
        let tables = self.tables_mut();
        let id = tables.next_file_id();
        tables.files.insert(
            id,
            FileRow {
                id,
                path: path.to_string(),
                content,
                metadata,
            },
        );
        tables.file_by_key.insert(key, id);
        Ok(id)
    }

    pub fn file(&self, id: FileId) -> Result<&FileRow> {
        self.tables()
            .files
            .get(&id)
            .ok_or(KeelError::FileNotFound(id))
    }

    /// Look up a file and its blocksets. A missing blockset is corruption.
    pub fn resolve_file(&self, id: FileId) -> Result<ResolvedFile<'_>> {
        let tables = self.tables();
        let file = tables.files.get(&id).ok_or(KeelError::FileNotFound(id))?;
        let dangling = |blockset_id| KeelError::DanglingBlockset {
            file_id: id,
            path: file.path.clone(),
            blockset_id,
        };
        let content = match file.content.blockset() {
            Some(bs) => Some(tables.blocksets.get(&bs).ok_or_else(|| dangling(bs))?),
            None => None,
        };
        let metadata = tables
            .blocksets
            .get(&file.metadata)
            .ok_or_else(|| dangling(file.metadata))?;
        Ok(ResolvedFile {
            file,
            content,
            metadata,
        })
    }

    /// Ordered block hashes of a blockset.
    pub fn blockset_hashes(&self, id: BlocksetId) -> Result<Vec<BlockHash>> {
        let blockset = self.blockset(id)?;
        blockset
            .blocks
            .iter()
            .map(|b| self.block(*b).map(|row| row.hash))
            .collect()
    }
}
