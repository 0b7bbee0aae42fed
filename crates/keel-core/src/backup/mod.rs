//! Backup run driver: scanning input into blocks, packing new blocks into
//! Blocks volumes and finishing with a filelist.

mod pipeline;
mod prepare;
pub mod volume_writer;
mod walk;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Utc;
use keel_storage::StorageBackend;
use keel_types::block_hash::BlockHash;
use keel_types::error::{KeelError, Result};
use keel_types::ids::{BlocksetId, FileId, FilesetId, VolumeId};
use keel_types::volume::{VolumeState, VolumeType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::catalog::{Catalog, ContentRef, ElementType, RemoteVolumeRow};
use crate::config::BackupConfig;
use crate::filelist::{load_control_files, probe_unused_filename, FilelistWriter};
use crate::stats::{BackupResults, StatsAccumulator};
use crate::synthetic::{upload_synthetic_filelist, SyntheticOutcome};

use self::prepare::{HashedBlocks, PreparedContent, PreparedEntry};
use self::volume_writer::{block_volume_name, BlockVolumeWriter};

/// Filesystem attributes stored as a file's metadata blockset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Modification time, nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
    pub mode: u32,
    pub link_target: Option<String>,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub fileset_id: FilesetId,
    pub filelist_volume: String,
    pub blocks_volumes: usize,
    pub results: BackupResults,
}

struct PendingUpload {
    volume_id: VolumeId,
    name: String,
    handle: JoinHandle<Result<()>>,
}

/// Previous version of a path, for change statistics.
struct PriorVersion {
    content_hash: Option<BlockHash>,
    metadata_hash: BlockHash,
    element_type: ElementType,
}

/// One backup run against a catalog and backend.
///
/// Dropping a session without calling [`BackupSession::finish`] rolls back
/// whatever it has not committed.
pub struct BackupSession<'a> {
    catalog: &'a mut Catalog,
    backend: Arc<dyn StorageBackend>,
    config: BackupConfig,
    cancel: CancellationToken,
    stats: StatsAccumulator,
    fileset_id: FilesetId,
    filelist: Option<FilelistWriter>,
    previous: Option<FilesetId>,
    current_volume: Option<BlockVolumeWriter>,
    /// Files whose blocks sit in the open volume, by path; they join the
    /// fileset once that volume is committed for upload.
    deferred: BTreeMap<String, FileId>,
    pending_uploads: VecDeque<PendingUpload>,
    blocks_volumes: usize,
    finished: bool,
}

impl<'a> BackupSession<'a> {
    /// Most recent Files volume still `Temporary` or `Uploading`.
    pub fn last_temporary_filelist(catalog: &Catalog) -> Option<RemoteVolumeRow> {
        catalog
            .tables()
            .volumes()
            .filter(|v| {
                v.kind == VolumeType::Files
                    && matches!(v.state, VolumeState::Temporary | VolumeState::Uploading)
            })
            .max_by_key(|v| v.id)
            .cloned()
    }

    /// Heal an interrupted previous run. Call before [`BackupSession::begin`].
    pub fn recover_interrupted(
        catalog: &mut Catalog,
        backend: &dyn StorageBackend,
        config: &BackupConfig,
        cancel: &CancellationToken,
    ) -> Result<SyntheticOutcome> {
        let last = Self::last_temporary_filelist(catalog);
        upload_synthetic_filelist(catalog, backend, config, last.as_ref(), cancel)
    }

    /// Create the run's fileset and its `Temporary` filelist volume.
    pub fn begin(
        catalog: &'a mut Catalog,
        backend: Arc<dyn StorageBackend>,
        config: BackupConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        cancel.rendezvous("backup start")?;
        let previous = catalog.last_complete_fileset_before(None);

        let (fileset_id, filelist) = catalog.transaction("backup_begin", |catalog| {
            let timestamp = probe_unused_filename(catalog, Utc::now());
            let mut writer = FilelistWriter::new(timestamp);
            let volume_id = catalog.register_volume(writer.remote_name(), VolumeType::Files)?;
            writer.volume_id = Some(volume_id);
            let fileset_id = catalog.create_fileset(timestamp);
            catalog.link_fileset_to_volume(fileset_id, volume_id)?;
            Ok((fileset_id, writer))
        })?;
        info!(
            fileset_id = %fileset_id,
            previous = ?previous,
            filelist = filelist.remote_name(),
            backend = %backend.label(),
            "backup started"
        );

        Ok(Self {
            catalog,
            backend,
            config,
            cancel,
            stats: StatsAccumulator::new(),
            fileset_id,
            filelist: Some(filelist),
            previous,
            current_volume: None,
            deferred: BTreeMap::new(),
            pending_uploads: VecDeque::new(),
            blocks_volumes: 0,
            finished: false,
        })
    }

    /// Cancellation checkpoint; a cancelled run drops its open transaction.
    fn rendezvous(&mut self, phase: &str) -> Result<()> {
        if let Err(e) = self.cancel.rendezvous(phase) {
            self.catalog.rollback();
            return Err(e);
        }
        Ok(())
    }

    pub fn fileset_id(&self) -> FilesetId {
        self.fileset_id
    }

    pub fn previous_fileset(&self) -> Option<FilesetId> {
        self.previous
    }

    pub fn stats(&self) -> BackupResults {
        self.stats.snapshot()
    }

    pub fn catalog(&self) -> &Catalog {
        &*self.catalog
    }

    /// Back up a regular file's content.
    pub fn add_file(&mut self, path: &str, data: &[u8], metadata: &EntryMetadata) -> Result<FileId> {
        let block_size = self.config.block_size as usize;
        let entry = PreparedEntry::file(path, data.to_vec(), metadata, block_size)?;
        self.add_prepared(entry)
    }

    pub fn add_folder(&mut self, path: &str, metadata: &EntryMetadata) -> Result<FileId> {
        let block_size = self.config.block_size as usize;
        let entry = PreparedEntry::new(path, PreparedContent::Folder, metadata, block_size)?;
        self.add_prepared(entry)
    }

    pub fn add_symlink(&mut self, path: &str, target: &str, metadata: &EntryMetadata) -> Result<FileId> {
        let metadata = EntryMetadata {
            link_target: Some(target.to_string()),
            ..metadata.clone()
        };
        let block_size = self.config.block_size as usize;
        let entry = PreparedEntry::new(path, PreparedContent::Symlink, &metadata, block_size)?;
        self.add_prepared(entry)
    }

    /// Dedup, pack and record an entry whose blocks are already hashed.
    pub(crate) fn add_prepared(&mut self, entry: PreparedEntry) -> Result<FileId> {
        self.rendezvous("scan")?;
        let size = entry.size();
        self.stats.add_examined_file(size);
        let prior = self.prior_version(&entry.path)?;

        let (metadata_id, metadata_volume) = self.store_blocks(&entry.metadata)?;
        let metadata_hash = self.catalog.blockset(metadata_id)?.full_hash;

        let (content, content_volume) = match &entry.content {
            PreparedContent::File(blocks) => {
                if prior.as_ref().is_some_and(|p| p.metadata_hash != metadata_hash) {
                    self.stats.add_timestamp_changed_file();
                }
                self.stats.add_opened_file(size);
                let (content_id, volume) = self.store_blocks(blocks)?;
                let content_hash = self.catalog.blockset(content_id)?.full_hash;
                let changed = prior.as_ref().map(|p| {
                    p.element_type != ElementType::File || p.content_hash != Some(content_hash)
                });
                self.count_change(changed, size);
                (ContentRef::Blockset(content_id), volume)
            }
            PreparedContent::Folder => {
                self.count_special_change(ContentRef::Folder, prior.as_ref(), metadata_hash)
            }
            PreparedContent::Symlink => {
                self.count_special_change(ContentRef::Symlink, prior.as_ref(), metadata_hash)
            }
        };

        self.record_entry(
            &entry.path,
            content,
            metadata_id,
            &[metadata_volume, content_volume],
        )
    }

    /// Folders and symlinks change with their type or metadata.
    fn count_special_change(
        &self,
        content: ContentRef,
        prior: Option<&PriorVersion>,
        metadata_hash: BlockHash,
    ) -> (ContentRef, Option<VolumeId>) {
        let changed = prior
            .map(|p| p.element_type != content.element_type() || p.metadata_hash != metadata_hash);
        self.count_change(changed, 0);
        (content, None)
    }

    /// `None` means the path is new; `Some(true)` means it changed.
    fn count_change(&self, changed: Option<bool>, size: u64) {
        match changed {
            None => {
                self.stats.add_added_file(size);
            }
            Some(true) => {
                self.stats.add_modified_file(size);
            }
            Some(false) => {}
        }
    }

    /// Record the file and make it visible in the fileset, or hold it back
    /// while any of its blocks sit in the still-open volume. The latest add
    /// of a path always wins.
    fn record_entry(
        &mut self,
        path: &str,
        content: ContentRef,
        metadata: BlocksetId,
        touched: &[Option<VolumeId>],
    ) -> Result<FileId> {
        let file_id = self.catalog.record_file(path, content, metadata)?;
        let open = self.open_volume_id();
        if open.is_some() && touched.contains(&open) {
            self.deferred.insert(path.to_string(), file_id);
        } else {
            self.deferred.remove(path);
            self.catalog.add_entry(self.fileset_id, file_id)?;
        }
        Ok(file_id)
    }

    fn prior_version(&self, path: &str) -> Result<Option<PriorVersion>> {
        let Some(previous) = self.previous else {
            return Ok(None);
        };
        let Some(file_id) = self.catalog.fileset_entries(previous)?.get(path).copied() else {
            return Ok(None);
        };
        let resolved = self.catalog.resolve_file(file_id)?;
        Ok(Some(PriorVersion {
            content_hash: resolved.content.map(|bs| bs.full_hash),
            metadata_hash: resolved.metadata.full_hash,
            element_type: resolved.file.content.element_type(),
        }))
    }

    /// Pack the blocks the backend does not hold yet. Returns the blockset
    /// and the last open volume any of its blocks were found in or added to.
    fn store_blocks(&mut self, blocks: &HashedBlocks) -> Result<(BlocksetId, Option<VolumeId>)> {
        let mut ids = Vec::new();
        let mut last_open = None;
        for (hash, chunk) in blocks.blocks() {
            let id = self.catalog.lookup_or_create_block(hash, chunk.len() as u64)?;
            ids.push(id);

            let holder = self.catalog.block(id)?.volume_id;
            if self.is_held(holder)? {
                if holder.is_some() && holder == self.open_volume_id() {
                    last_open = holder;
                }
                continue;
            }
            let volume_id = self.ensure_open_volume()?;
            if let Some(writer) = self.current_volume.as_mut() {
                writer.add(hash, chunk);
            }
            self.catalog.assign_block_volume(id, volume_id)?;
            last_open = Some(volume_id);

            if self
                .current_volume
                .as_ref()
                .is_some_and(|w| w.size() >= self.config.volume_size)
            {
                self.flush_volume()?;
            }
        }
        let blockset = self.catalog.create_blockset(&ids)?;
        Ok((blockset, last_open))
    }

    fn open_volume_id(&self) -> Option<VolumeId> {
        self.current_volume.as_ref().map(BlockVolumeWriter::volume_id)
    }

    /// A block is held if it sits in the open volume or in one that is
    /// uploading or already on the backend.
    fn is_held(&self, holder: Option<VolumeId>) -> Result<bool> {
        let Some(volume) = holder else {
            return Ok(false);
        };
        if Some(volume) == self.open_volume_id() {
            return Ok(true);
        }
        let state = self.catalog.volume(volume)?.state;
        Ok(matches!(
            state,
            VolumeState::Uploading | VolumeState::Uploaded | VolumeState::Verified
        ))
    }

    fn ensure_open_volume(&mut self) -> Result<VolumeId> {
        if let Some(writer) = &self.current_volume {
            return Ok(writer.volume_id());
        }
        let name = block_volume_name();
        let volume_id = self.catalog.register_volume(&name, VolumeType::Blocks)?;
        debug!(volume = %name, "opened blocks volume");
        self.current_volume = Some(BlockVolumeWriter::new(volume_id, name));
        Ok(volume_id)
    }

    /// Seal the open volume, commit it as `Uploading` together with the
    /// files waiting on it, and start its upload in the background.
    fn flush_volume(&mut self) -> Result<()> {
        let Some(writer) = self.current_volume.take() else {
            return Ok(());
        };
        if writer.is_empty() {
            return Ok(());
        }
        self.cap_pending_uploads()?;

        let sealed = writer.seal()?;
        for file_id in std::mem::take(&mut self.deferred).into_values() {
            self.catalog.add_entry(self.fileset_id, file_id)?;
        }
        self.rendezvous("blocks volume commit")?;
        self.catalog.update_volume_state(
            sealed.volume_id,
            VolumeState::Uploading,
            Some(sealed.bytes.len() as u64),
            Some(sealed.hash.clone()),
        )?;
        self.catalog.commit("blocks_volume_uploading")?;
        debug!(
            volume = %sealed.name,
            blocks = sealed.block_count,
            bytes = sealed.bytes.len(),
            "uploading blocks volume"
        );

        let backend = Arc::clone(&self.backend);
        let name = sealed.name.clone();
        let bytes = sealed.bytes;
        let handle = std::thread::spawn(move || backend.put(&name, &bytes));
        self.pending_uploads.push_back(PendingUpload {
            volume_id: sealed.volume_id,
            name: sealed.name,
            handle,
        });
        self.blocks_volumes += 1;
        Ok(())
    }

    /// Wait for the oldest background upload and record its completion.
    fn wait_one_pending_upload(&mut self) -> Result<()> {
        let Some(upload) = self.pending_uploads.pop_front() else {
            return Ok(());
        };
        upload
            .handle
            .join()
            .map_err(|_| KeelError::Other("volume upload thread panicked".into()))??;
        self.catalog
            .update_volume_state(upload.volume_id, VolumeState::Uploaded, None, None)?;
        self.catalog.commit("blocks_volume_uploaded")?;
        debug!(volume = %upload.name, "blocks volume uploaded");
        Ok(())
    }

    fn wait_pending_uploads(&mut self) -> Result<()> {
        while !self.pending_uploads.is_empty() {
            self.wait_one_pending_upload()?;
        }
        Ok(())
    }

    /// Keep the number of in-flight uploads within `upload_concurrency`.
    fn cap_pending_uploads(&mut self) -> Result<()> {
        while self.pending_uploads.len() >= self.config.upload_concurrency {
            self.wait_one_pending_upload()?;
        }
        Ok(())
    }

    /// Flush and upload everything written so far without finishing the run.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.flush_volume()?;
        self.wait_pending_uploads()
    }

    /// Seal the fileset and upload its filelist.
    pub fn finish(mut self) -> Result<BackupSummary> {
        self.rendezvous("backup finish")?;
        self.checkpoint()?;
        for file_id in std::mem::take(&mut self.deferred).into_values() {
            self.catalog.add_entry(self.fileset_id, file_id)?;
        }

        let Some(mut writer) = self.filelist.take() else {
            return Err(KeelError::Other("backup session already finished".into()));
        };
        let volume_id = writer
            .volume_id
            .ok_or(KeelError::MissingParameter("filelist volume"))?;
        for file in load_control_files(&self.config.control_files)? {
            writer.add_control_file(file);
        }
        self.catalog.seal_fileset(self.fileset_id)?;
        writer.create_fileset_file(true);
        writer.write_fileset(&*self.catalog, self.fileset_id)?;
        let closed = writer.close()?;

        self.rendezvous("filelist commit")?;
        self.catalog.update_volume_state(
            volume_id,
            VolumeState::Uploading,
            Some(closed.size()),
            Some(closed.hash.clone()),
        )?;
        self.catalog.commit("filelist_uploading")?;

        self.backend.put(&closed.name, &closed.bytes)?;
        self.catalog
            .update_volume_state(volume_id, VolumeState::Uploaded, None, None)?;
        self.catalog.commit("backup_complete")?;
        self.finished = true;

        let results = self.stats.snapshot();
        info!(
            fileset_id = %self.fileset_id,
            examined = results.examined_files,
            added = results.added_files,
            modified = results.modified_files,
            volumes = self.blocks_volumes,
            "backup complete"
        );
        Ok(BackupSummary {
            fileset_id: self.fileset_id,
            filelist_volume: closed.name,
            blocks_volumes: self.blocks_volumes,
            results,
        })
    }
}

impl Drop for BackupSession<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Committed as `Uploading`; settle the transfers before reconciliation
        // looks at the backend.
        for upload in self.pending_uploads.drain(..) {
            match upload.handle.join() {
                Ok(Ok(())) => {
                    debug!(volume = %upload.name, "blocks volume uploaded after abandon");
                }
                Ok(Err(e)) => {
                    warn!(volume = %upload.name, error = %e, "blocks volume upload failed");
                }
                Err(_) => {
                    warn!(volume = %upload.name, "volume upload thread panicked");
                }
            }
        }
        if self.catalog.in_transaction() {
            warn!(fileset_id = %self.fileset_id, "backup session abandoned, rolling back");
            self.catalog.rollback();
        }
    }
}
