use serde::{Deserialize, Serialize};
use std::fmt;

/// What a remote volume carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeType {
    /// Packed block content.
    Blocks,
    /// A serialized fileset descriptor (filelist).
    Files,
    /// Block-to-volume lookup data.
    Index,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeType::Blocks => "blocks",
            VolumeType::Files => "files",
            VolumeType::Index => "index",
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a remote volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    Temporary,
    Uploading,
    Uploaded,
    Verified,
    Deleting,
    Deleted,
    Error,
}

impl VolumeState {
    pub const ALL: [VolumeState; 7] = [
        VolumeState::Temporary,
        VolumeState::Uploading,
        VolumeState::Uploaded,
        VolumeState::Verified,
        VolumeState::Deleting,
        VolumeState::Deleted,
        VolumeState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Temporary => "temporary",
            VolumeState::Uploading => "uploading",
            VolumeState::Uploaded => "uploaded",
            VolumeState::Verified => "verified",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
            VolumeState::Error => "error",
        }
    }

    /// No edge leaves a terminal state except the move into `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VolumeState::Verified | VolumeState::Deleted | VolumeState::Error
        )
    }

    /// The volume's content is known to be on the remote.
    pub fn is_durable(&self) -> bool {
        matches!(self, VolumeState::Uploaded | VolumeState::Verified)
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
