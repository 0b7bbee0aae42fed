//! Hashing stage: turns raw content and metadata into block hashes before
//! anything touches the catalog. Runs on scan workers or inline.

use keel_types::block_hash::BlockHash;
use keel_types::error::Result;

use super::EntryMetadata;

/// Bytes split into fixed-size blocks, each with its hash.
#[derive(Debug, Clone)]
pub(crate) struct HashedBlocks {
    data: Vec<u8>,
    block_size: usize,
    hashes: Vec<BlockHash>,
}

impl HashedBlocks {
    pub(crate) fn new(data: Vec<u8>, block_size: usize) -> Self {
        let hashes = data.chunks(block_size).map(BlockHash::compute).collect();
        Self {
            data,
            block_size,
            hashes,
        }
    }

    pub(crate) fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub(crate) fn blocks(&self) -> impl Iterator<Item = (BlockHash, &[u8])> {
        self.hashes
            .iter()
            .copied()
            .zip(self.data.chunks(self.block_size))
    }
}

#[derive(Debug, Clone)]
pub(crate) enum PreparedContent {
    File(HashedBlocks),
    Folder,
    Symlink,
}

/// One entry ready for dedup and packing.
#[derive(Debug, Clone)]
pub(crate) struct PreparedEntry {
    pub(crate) path: String,
    pub(crate) content: PreparedContent,
    pub(crate) metadata: HashedBlocks,
}

impl PreparedEntry {
    pub(crate) fn new(
        path: impl Into<String>,
        content: PreparedContent,
        metadata: &EntryMetadata,
        block_size: usize,
    ) -> Result<Self> {
        let bytes = rmp_serde::to_vec(metadata)?;
        Ok(Self {
            path: path.into(),
            content,
            metadata: HashedBlocks::new(bytes, block_size),
        })
    }

    pub(crate) fn file(
        path: impl Into<String>,
        data: Vec<u8>,
        metadata: &EntryMetadata,
        block_size: usize,
    ) -> Result<Self> {
        let content = PreparedContent::File(HashedBlocks::new(data, block_size));
        Self::new(path, content, metadata, block_size)
    }

    /// Content length; folders and symlinks are 0.
    pub(crate) fn size(&self) -> u64 {
        match &self.content {
            PreparedContent::File(blocks) => blocks.len(),
            PreparedContent::Folder | PreparedContent::Symlink => 0,
        }
    }
}
