use std::fmt;

use thiserror::Error;

use crate::ids::{BlocksetId, FileId, FilesetId, VolumeId};
use crate::volume::VolumeState;

pub type Result<T> = std::result::Result<T, KeelError>;

/// Maximum number of payload bytes kept in a deserialization preview.
pub const PREVIEW_LIMIT: usize = 64;

/// Broad category of an error, used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    UserInput,
    DataIntegrity,
    TransientRemote,
    FatalRemote,
    Deserialization,
    Storage,
    Cancelled,
}

/// Classification a backend attaches to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Retrying later may succeed (timeouts, connection resets).
    Transient,
    /// Needs user action (bad credentials, missing bucket, permission denied).
    Fatal,
}

impl fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendErrorKind::Transient => f.write_str("transient"),
            BackendErrorKind::Fatal => f.write_str("fatal"),
        }
    }
}

/// Bounded hex dump of a payload that failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadPreview {
    pub hex: String,
    pub total_len: usize,
    pub truncated: bool,
}

impl PayloadPreview {
    pub fn of(data: &[u8]) -> Self {
        let shown = data.len().min(PREVIEW_LIMIT);
        PayloadPreview {
            hex: hex::encode(&data[..shown]),
            total_len: data.len(),
            truncated: data.len() > PREVIEW_LIMIT,
        }
    }
}

impl fmt::Display for PayloadPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.truncated {
            write!(
                f,
                "{}... (first {PREVIEW_LIMIT} of {} bytes)",
                self.hex, self.total_len
            )
        } else {
            write!(f, "{} ({} bytes)", self.hex, self.total_len)
        }
    }
}

#[derive(Debug, Error)]
pub enum KeelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("remote volume already registered: '{0}'")]
    VolumeAlreadyRegistered(String),

    #[error("remote volume not found: '{0}'")]
    VolumeNotFound(String),

    #[error("invalid state transition for volume {id} ('{name}'): {from} -> {to}")]
    InvalidStateTransition {
        id: VolumeId,
        name: String,
        from: VolumeState,
        to: VolumeState,
    },

    #[error("fileset not found: {0}")]
    FilesetNotFound(FilesetId),

    #[error("fileset {0} is sealed; entries can no longer be added")]
    FilesetSealed(FilesetId),

    #[error("file not found: {0}")]
    FileNotFound(FileId),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("blockset not found: {0}")]
    BlocksetNotFound(BlocksetId),

    #[error("block {hash} already recorded with size {existing}, got {given}")]
    BlockSizeMismatch {
        hash: String,
        existing: u64,
        given: u64,
    },

    #[error("file {file_id} ('{path}') references missing blockset {blockset_id}")]
    DanglingBlockset {
        file_id: FileId,
        path: String,
        blockset_id: BlocksetId,
    },

    #[error("{kind} backend error during {op} of '{key}': {message}")]
    Backend {
        kind: BackendErrorKind,
        op: &'static str,
        key: String,
        message: String,
    },

    #[error("malformed {context}: {message}; payload: {preview}")]
    Deserialization {
        context: &'static str,
        message: String,
        preview: PayloadPreview,
    },

    #[error("unsupported {what} version: {version}")]
    UnsupportedVersion { what: &'static str, version: u32 },

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("{0}")]
    Other(String),
}

impl KeelError {
    /// Build a deserialization error that keeps a bounded preview of `data`.
    pub fn deserialization(
        context: &'static str,
        err: impl fmt::Display,
        data: &[u8],
    ) -> Self {
        KeelError::Deserialization {
            context,
            message: err.to_string(),
            preview: PayloadPreview::of(data),
        }
    }

    pub fn backend(
        kind: BackendErrorKind,
        op: &'static str,
        key: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        KeelError::Backend {
            kind,
            op,
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Stable machine-readable code. Never changes once published.
    pub fn code(&self) -> &'static str {
        match self {
            KeelError::Config(_) => "config.invalid",
            KeelError::MissingParameter(_) => "input.missing_parameter",
            KeelError::UnsupportedBackend(_) => "config.unsupported_backend",
            KeelError::VolumeAlreadyRegistered(_) => "volume.already_registered",
            KeelError::VolumeNotFound(_) => "volume.not_found",
            KeelError::InvalidStateTransition { .. } => "volume.invalid_transition",
            KeelError::FilesetNotFound(_) => "fileset.not_found",
            KeelError::FilesetSealed(_) => "fileset.sealed",
            KeelError::FileNotFound(_) => "file.not_found",
            KeelError::BlockNotFound(_) => "block.not_found",
            KeelError::BlocksetNotFound(_) => "blockset.not_found",
            KeelError::BlockSizeMismatch { .. } => "block.size_mismatch",
            KeelError::DanglingBlockset { .. } => "file.dangling_blockset",
            KeelError::Backend {
                kind: BackendErrorKind::Transient,
                ..
            } => "backend.transient",
            KeelError::Backend {
                kind: BackendErrorKind::Fatal,
                ..
            } => "backend.fatal",
            KeelError::Deserialization { .. } => "data.malformed",
            KeelError::UnsupportedVersion { .. } => "data.unsupported_version",
            KeelError::Serialization(_) => "data.serialization",
            KeelError::Io(_) => "storage.io",
            KeelError::Cancelled(_) => "operation.cancelled",
            KeelError::Other(_) => "other",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            KeelError::Config(_) | KeelError::UnsupportedBackend(_) => ErrorKind::Configuration,
            KeelError::MissingParameter(_)
            | KeelError::VolumeAlreadyRegistered(_)
            | KeelError::VolumeNotFound(_)
            | KeelError::FilesetNotFound(_)
            | KeelError::FilesetSealed(_) => ErrorKind::UserInput,
            KeelError::InvalidStateTransition { .. }
            | KeelError::FileNotFound(_)
            | KeelError::BlockNotFound(_)
            | KeelError::BlocksetNotFound(_)
            | KeelError::BlockSizeMismatch { .. }
            | KeelError::DanglingBlockset { .. } => ErrorKind::DataIntegrity,
            KeelError::Backend {
                kind: BackendErrorKind::Transient,
                ..
            } => ErrorKind::TransientRemote,
            KeelError::Backend {
                kind: BackendErrorKind::Fatal,
                ..
            } => ErrorKind::FatalRemote,
            KeelError::Deserialization { .. } | KeelError::UnsupportedVersion { .. } => {
                ErrorKind::Deserialization
            }
            KeelError::Serialization(_) | KeelError::Io(_) | KeelError::Other(_) => {
                ErrorKind::Storage
            }
            KeelError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether the surrounding orchestration may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientRemote
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_bounded_and_flags_truncation() {
        let data = vec![0xabu8; 200];
        let preview = PayloadPreview::of(&data);
        assert_eq!(preview.hex.len(), PREVIEW_LIMIT * 2);
        assert_eq!(preview.total_len, 200);
        assert!(preview.truncated);
        assert!(preview.to_string().contains("first 64 of 200 bytes"));
    }

    #[test]
    fn preview_of_short_payload_is_complete() {
        let preview = PayloadPreview::of(b"\x01\x02");
        assert_eq!(preview.hex, "0102");
        assert!(!preview.truncated);
    }

    #[test]
    fn invalid_transition_message_has_context() {
        let err = KeelError::InvalidStateTransition {
            id: VolumeId(4),
            name: "keel-x.dlist".into(),
            from: VolumeState::Uploaded,
            to: VolumeState::Temporary,
        };
        let msg = err.to_string();
        assert!(msg.contains("keel-x.dlist"));
        assert!(msg.contains("uploaded -> temporary"));
        assert_eq!(err.code(), "volume.invalid_transition");
        assert_eq!(err.kind(), ErrorKind::DataIntegrity);
    }

    #[test]
    fn backend_classification_drives_transience() {
        let transient = KeelError::backend(BackendErrorKind::Transient, "put", "a", "timeout");
        let fatal = KeelError::backend(BackendErrorKind::Fatal, "put", "a", "denied");
        assert!(transient.is_transient());
        assert!(!fatal.is_transient());
        assert_eq!(fatal.kind(), ErrorKind::FatalRemote);
        assert_eq!(transient.code(), "backend.transient");
    }

    #[test]
    fn lookup_failures_are_user_input() {
        let missing = KeelError::VolumeNotFound("keel-a.dlist".into());
        assert_eq!(missing.code(), "volume.not_found");
        assert_eq!(missing.kind(), ErrorKind::UserInput);
        assert_eq!(
            KeelError::MissingParameter("fileset kind").kind(),
            ErrorKind::UserInput
        );
        assert!(!missing.is_transient());
    }
}
