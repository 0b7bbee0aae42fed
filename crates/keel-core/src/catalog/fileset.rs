use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use keel_types::error::{KeelError, Result};
use keel_types::ids::{FileId, FilesetId, VolumeId};
use keel_types::volume::VolumeType;
use tracing::{debug, info};

use super::tables::FilesetRow;
use super::Catalog;

impl Catalog {
    /// Create an unsealed, non-partial fileset.
    pub fn create_fileset(&mut self, timestamp: DateTime<Utc>) -> FilesetId {
        let tables = self.tables_mut();
        let id = tables.next_fileset_id();
        tables.filesets.insert(
            id,
            FilesetRow {
                id,
                timestamp,
                volume_id: None,
                sealed: false,
                partial: false,
            },
        );
        tables.fileset_entries.insert(id, BTreeMap::new());
        debug!(fileset_id = %id, %timestamp, "created fileset");
        id
    }

    pub fn fileset(&self, id: FilesetId) -> Result<&FilesetRow> {
        self.tables()
            .filesets
            .get(&id)
            .ok_or(KeelError::FilesetNotFound(id))
    }

    fn fileset_mut(&mut self, id: FilesetId) -> Result<&mut FilesetRow> {
        self.tables_mut()
            .filesets
            .get_mut(&id)
            .ok_or(KeelError::FilesetNotFound(id))
    }

    pub fn set_fileset_partial(&mut self, id: FilesetId, partial: bool) -> Result<()> {
        self.fileset_mut(id)?.partial = partial;
        Ok(())
    }

    /// Attach the Files-type volume that carries this fileset's filelist.
    pub fn link_fileset_to_volume(&mut self, id: FilesetId, volume: VolumeId) -> Result<()> {
        let kind = self.volume(volume)?.kind;
        if kind != VolumeType::Files {
            return Err(KeelError::Other(format!(
                "fileset {id} can only be linked to a files volume, volume {volume} is {kind}"
            )));
        }
        self.fileset_mut(id)?.volume_id = Some(volume);
        Ok(())
    }

    /// Make `file_id` the visible version of its path in `fileset_id`.
    ///
    /// A later entry for the same path replaces the earlier one. Rejected
    /// once the fileset is sealed.
    pub fn add_entry(&mut self, fileset_id: FilesetId, file_id: FileId) -> Result<()> {
        if self.fileset(fileset_id)?.sealed {
            return Err(KeelError::FilesetSealed(fileset_id));
        }
        let path = self.file(file_id)?.path.clone();
        self.tables_mut()
            .fileset_entries
            .entry(fileset_id)
            .or_default()
            .insert(path, file_id);
        Ok(())
    }

    /// Finalize a fileset's membership. Idempotent.
    ///
    /// Every entry must resolve to existing blocksets; a dangling reference
    /// fails the seal and leaves the fileset open.
    pub fn seal_fileset(&mut self, id: FilesetId) -> Result<()> {
        if self.fileset(id)?.sealed {
            return Ok(());
        }
        for file_id in self.entry_ids(id)? {
            self.resolve_file(file_id)?;
        }
        self.fileset_mut(id)?.sealed = true;
        info!(fileset_id = %id, entries = self.entry_count(id), "sealed fileset");
        Ok(())
    }

    /// Path-ordered entries of a fileset.
    pub fn fileset_entries(&self, id: FilesetId) -> Result<&BTreeMap<String, FileId>> {
        self.fileset(id)?;
        Ok(self
            .tables()
            .fileset_entries
            .get(&id)
            .unwrap_or(&EMPTY_ENTRIES))
    }

    fn entry_ids(&self, id: FilesetId) -> Result<Vec<FileId>> {
        Ok(self.fileset_entries(id)?.values().copied().collect())
    }

    fn entry_count(&self, id: FilesetId) -> usize {
        self.tables()
            .fileset_entries
            .get(&id)
            .map_or(0, BTreeMap::len)
    }

    /// Filesets whose filelist volume never reached `Uploaded`/`Verified`,
    /// ordered by timestamp.
    pub fn get_incomplete_filesets(&self) -> Vec<(FilesetId, DateTime<Utc>)> {
        let tables = self.tables();
        let mut out: Vec<_> = tables
            .filesets
            .values()
            .filter(|fs| {
                fs.volume_id
                    .and_then(|v| tables.volumes.get(&v))
                    .map_or(true, |v| !v.state.is_durable())
            })
            .map(|fs| (fs.id, fs.timestamp))
            .collect();
        out.sort_by_key(|(id, ts)| (*ts, *id));
        out
    }

    /// All filesets ordered by timestamp ascending.
    pub fn get_fileset_times(&self) -> Vec<(FilesetId, DateTime<Utc>)> {
        let mut out: Vec<_> = self
            .tables()
            .filesets
            .values()
            .map(|fs| (fs.id, fs.timestamp))
            .collect();
        out.sort_by_key(|(id, ts)| (*ts, *id));
        out
    }

    /// Most recent complete fileset ordered strictly before `before` by
    /// (timestamp, id). `None` bound means the latest complete one.
    pub fn last_complete_fileset_before(
        &self,
        before: Option<(DateTime<Utc>, FilesetId)>,
    ) -> Option<FilesetId> {
        let incomplete: Vec<FilesetId> = self
            .get_incomplete_filesets()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        self.get_fileset_times()
            .into_iter()
            .filter(|(id, ts)| before.map_or(true, |b| (*ts, *id) < b))
            .filter(|(id, _)| !incomplete.contains(id))
            .map(|(id, _)| id)
            .last()
    }

    /// Fill `target` from `previous` and `incomplete`.
    ///
    /// Copies every entry of `previous` whose path is not recorded in
    /// `incomplete`, then every entry of `incomplete`; paths recorded in the
    /// interrupted run take precedence.
    pub fn append_files_from_previous_set(
        &mut self,
        target: FilesetId,
        previous: Option<FilesetId>,
        incomplete: FilesetId,
    ) -> Result<usize> {
        let recent = self.fileset_entries(incomplete)?.clone();
        let mut merged = match previous {
            Some(prev) => self.fileset_entries(prev)?.clone(),
            None => BTreeMap::new(),
        };
        merged.extend(recent);

        let count = merged.len();
        for file_id in merged.into_values() {
            self.add_entry(target, file_id)?;
        }
        Ok(count)
    }

    /// Drop a fileset and its entries once its filelist volume is gone.
    pub(crate) fn remove_fileset(&mut self, id: FilesetId) -> Result<()> {
        self.fileset(id)?;
        let tables = self.tables_mut();
        tables.filesets.remove(&id);
        tables.fileset_entries.remove(&id);
        debug!(fileset_id = %id, "removed fileset");
        Ok(())
    }

    /// Filesets whose filelist lives in `volume`.
    pub fn filesets_in_volume(&self, volume: VolumeId) -> Vec<FilesetId> {
        self.tables()
            .filesets
            .values()
            .filter(|fs| fs.volume_id == Some(volume))
            .map(|fs| fs.id)
            .collect()
    }
}

static EMPTY_ENTRIES: BTreeMap<String, FileId> = BTreeMap::new();
