use keel_types::error::{KeelError, Result};
use keel_types::ids::VolumeId;
use keel_types::volume::{VolumeState, VolumeType};
use tracing::debug;

use super::tables::RemoteVolumeRow;
use super::Catalog;

/// Whether the lifecycle state machine has an edge `from -> to`.
pub fn transition_allowed(from: VolumeState, to: VolumeState) -> bool {
    use VolumeState::*;
    match (from, to) {
        (Temporary, Uploading)
        | (Uploading, Uploaded)
        | (Uploaded, Verified)
        | (Uploading, Temporary)
        | (Temporary, Deleting)
        | (Uploading, Deleting)
        | (Deleting, Deleted) => true,
        (from, Error) => from != Error,
        _ => false,
    }
}

/// Identifies a volume by row id or by its unique name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeRef<'a> {
    Id(VolumeId),
    Name(&'a str),
}

impl From<VolumeId> for VolumeRef<'_> {
    fn from(id: VolumeId) -> Self {
        VolumeRef::Id(id)
    }
}

impl<'a> From<&'a str> for VolumeRef<'a> {
    fn from(name: &'a str) -> Self {
        VolumeRef::Name(name)
    }
}

impl Catalog {
    /// Register a new volume in `Temporary` state.
    pub fn register_volume(&mut self, name: &str, kind: VolumeType) -> Result<VolumeId> {
        if name.trim().is_empty() {
            return Err(KeelError::MissingParameter("volume name"));
        }
        if self.tables().volume_by_name.contains_key(name) {
            return Err(KeelError::VolumeAlreadyRegistered(name.to_string()));
        }
        let tables = self.tables_mut();
        let id = tables.next_volume_id();
        tables.volumes.insert(
            id,
            RemoteVolumeRow {
                id,
                name: name.to_string(),
                kind,
                state: VolumeState::Temporary,
                size: None,
                hash: None,
            },
        );
        tables.volume_by_name.insert(name.to_string(), id);
        debug!(volume = name, %kind, id = %id, "registered volume");
        Ok(id)
    }

    fn resolve_volume_id(&self, volume: VolumeRef<'_>) -> Result<VolumeId> {
        match volume {
            VolumeRef::Id(id) if self.tables().volumes.contains_key(&id) => Ok(id),
            VolumeRef::Id(id) => Err(KeelError::VolumeNotFound(id.to_string())),
            VolumeRef::Name(name) => self
                .tables()
                .volume_by_name
                .get(name)
                .copied()
                .ok_or_else(|| KeelError::VolumeNotFound(name.to_string())),
        }
    }

    pub fn volume<'a>(&self, volume: impl Into<VolumeRef<'a>>) -> Result<&RemoteVolumeRow> {
        let id = self.resolve_volume_id(volume.into())?;
        self.tables()
            .volumes
            .get(&id)
            .ok_or_else(|| KeelError::VolumeNotFound(id.to_string()))
    }

    /// Move a volume along the lifecycle, optionally recording size and hash.
    ///
    /// Edges outside the state machine are rejected with
    /// `InvalidStateTransition`; the volume is left unchanged.
    pub fn update_volume_state<'a>(
        &mut self,
        volume: impl Into<VolumeRef<'a>>,
        state: VolumeState,
        size: Option<u64>,
        hash: Option<String>,
    ) -> Result<()> {
        let id = self.resolve_volume_id(volume.into())?;
        let row = self
            .tables_mut()
            .volumes
            .get_mut(&id)
            .ok_or_else(|| KeelError::VolumeNotFound(id.to_string()))?;
        if !transition_allowed(row.state, state) {
            return Err(KeelError::InvalidStateTransition {
                id,
                name: row.name.clone(),
                from: row.state,
                to: state,
            });
        }
        debug!(volume = %row.name, from = %row.state, to = %state, "volume state change");
        row.state = state;
        if size.is_some() {
            row.size = size;
        }
        if hash.is_some() {
            row.hash = hash;
        }
        Ok(())
    }

    /// All volumes in `state`, ordered by id.
    pub fn query_volumes_by_state(&self, state: VolumeState) -> Vec<RemoteVolumeRow> {
        self.tables()
            .volumes
            .values()
            .filter(|v| v.state == state)
            .cloned()
            .collect()
    }
}
