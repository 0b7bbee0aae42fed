use keel_types::block_hash::BlockHash;
use keel_types::error::{KeelError, Result};
use keel_types::ids::VolumeId;
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const BLOCK_VOLUME_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub hash: BlockHash,
    pub data: Vec<u8>,
}

/// Serialized contents of a Blocks volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVolumeDocument {
    pub version: u32,
    pub blocks: Vec<StoredBlock>,
}

/// Fresh random Blocks volume name.
pub fn block_volume_name() -> String {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    format!("keel-b{}.dblock", hex::encode(id))
}

/// Accumulates new blocks for one Blocks volume.
#[derive(Debug)]
pub struct BlockVolumeWriter {
    volume_id: VolumeId,
    name: String,
    blocks: Vec<StoredBlock>,
    size: u64,
}

/// A finished Blocks volume ready for upload.
#[derive(Debug)]
pub struct SealedVolume {
    pub volume_id: VolumeId,
    pub name: String,
    pub bytes: Vec<u8>,
    pub hash: String,
    pub block_count: usize,
}

impl BlockVolumeWriter {
    pub fn new(volume_id: VolumeId, name: String) -> Self {
        Self {
            volume_id,
            name,
            blocks: Vec::new(),
            size: 0,
        }
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw block bytes added so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn add(&mut self, hash: BlockHash, data: &[u8]) {
        self.size += data.len() as u64;
        self.blocks.push(StoredBlock {
            hash,
            data: data.to_vec(),
        });
    }

    pub fn seal(self) -> Result<SealedVolume> {
        let block_count = self.blocks.len();
        let document = BlockVolumeDocument {
            version: BLOCK_VOLUME_VERSION,
            blocks: self.blocks,
        };
        let bytes = rmp_serde::to_vec(&document)?;
        let hash = BlockHash::compute(&bytes).to_hex();
        Ok(SealedVolume {
            volume_id: self.volume_id,
            name: self.name,
            bytes,
            hash,
            block_count,
        })
    }
}

/// Decode Blocks volume bytes, checking each block against its hash.
pub fn decode_block_volume(data: &[u8]) -> Result<BlockVolumeDocument> {
    let document: BlockVolumeDocument = rmp_serde::from_slice(data)
        .map_err(|e| KeelError::deserialization("blocks volume", e, data))?;
    if document.version != BLOCK_VOLUME_VERSION {
        return Err(KeelError::UnsupportedVersion {
            what: "blocks volume",
            version: document.version,
        });
    }
    for block in &document.blocks {
        if BlockHash::compute(&block.data) != block.hash {
            return Err(KeelError::deserialization(
                "blocks volume",
                format!("block {} does not match its content", block.hash),
                &block.data,
            ));
        }
    }
    Ok(document)
}
