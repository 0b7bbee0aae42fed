//! Recovery of an interrupted backup by writing a synthetic filelist.
//!
//! When a run dies before its filelist volume is uploaded, the fileset it
//! was building stays incomplete. The next run merges that fileset with its
//! last complete predecessor into a new sealed, partial fileset and uploads
//! a filelist for it, so the history has no unusable gap.

use chrono::{DateTime, Utc};
use keel_storage::StorageBackend;
use keel_types::error::{KeelError, Result};
use keel_types::ids::{FilesetId, VolumeId};
use keel_types::volume::{VolumeState, VolumeType};
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::catalog::{Catalog, RemoteVolumeRow};
use crate::config::BackupConfig;
use crate::filelist::{
    load_control_files, probe_unused_filename, ClosedFilelist, ControlFile, FilelistWriter,
};

/// What [`upload_synthetic_filelist`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntheticOutcome {
    /// Synthetic filelists are turned off in the configuration.
    Disabled,
    /// No usable reference to a temporary filelist volume.
    NoTemporaryFilelist,
    /// The referenced filelist already left `Temporary`/`Uploading`.
    AlreadyComplete { volume: String, state: VolumeState },
    NoIncompleteFilesets,
    Uploaded(SyntheticFilelist),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticFilelist {
    pub fileset_id: FilesetId,
    pub timestamp: DateTime<Utc>,
    pub volume_id: VolumeId,
    pub volume_name: String,
    /// The interrupted fileset this one was built from.
    pub base: FilesetId,
    pub predecessor: Option<FilesetId>,
    pub entries: usize,
}

/// Build and upload a synthetic filelist for the most recent interrupted run.
///
/// Metadata changes happen in one transaction that is rolled back on any
/// failure before commit. After commit the new volume is `Uploading`; if the
/// physical upload then fails the error is returned and the volume stays
/// `Uploading` for a later run to resolve.
pub fn upload_synthetic_filelist(
    catalog: &mut Catalog,
    backend: &dyn StorageBackend,
    config: &BackupConfig,
    last_temporary: Option<&RemoteVolumeRow>,
    cancel: &CancellationToken,
) -> Result<SyntheticOutcome> {
    if config.disable_synthetic_filelist {
        return Ok(SyntheticOutcome::Disabled);
    }
    let Some(last) = last_temporary else {
        return Ok(SyntheticOutcome::NoTemporaryFilelist);
    };
    if last.name.trim().is_empty() || last.id.get() == 0 {
        return Ok(SyntheticOutcome::NoTemporaryFilelist);
    }

    // The caller's row may be stale; the catalog is authoritative.
    let state = match catalog.volume(last.id) {
        Ok(row) => row.state,
        Err(KeelError::VolumeNotFound(_)) => {
            warn!(volume = %last.name, "temporary filelist is not in the catalog");
            return Ok(SyntheticOutcome::NoTemporaryFilelist);
        }
        Err(e) => return Err(e),
    };
    if !matches!(state, VolumeState::Uploading | VolumeState::Temporary) {
        info!(
            id = %last.id,
            volume = %last.name,
            %state,
            "skipping synthetic upload because temporary fileset appears to be complete"
        );
        return Ok(SyntheticOutcome::AlreadyComplete {
            volume: last.name.clone(),
            state,
        });
    }

    catalog.commit("pre_synthetic_filelist")?;
    let incomplete = catalog.get_incomplete_filesets();
    let Some(&(base, base_time)) = incomplete.last() else {
        return Ok(SyntheticOutcome::NoIncompleteFilesets);
    };
    cancel.rendezvous("synthetic filelist")?;

    let predecessor = catalog.last_complete_fileset_before(Some((base_time, base)));
    info!(
        base = %base,
        predecessor = ?predecessor,
        "uploading filelist from previous interrupted backup"
    );

    let control_files = load_control_files(&config.control_files)?;
    let last_id = last.id;
    let (closed, synthetic) = catalog.transaction("synthetic_filelist", |catalog| {
        build_synthetic(
            catalog,
            last_id,
            base,
            base_time,
            predecessor,
            control_files,
            cancel,
        )
    })?;

    backend.put(&closed.name, &closed.bytes)?;

    catalog.update_volume_state(synthetic.volume_id, VolumeState::Uploaded, None, None)?;
    catalog.commit("synthetic_filelist_uploaded")?;
    info!(
        volume = %closed.name,
        fileset_id = %synthetic.fileset_id,
        entries = synthetic.entries,
        "synthetic filelist uploaded"
    );
    Ok(SyntheticOutcome::Uploaded(synthetic))
}

fn build_synthetic(
    catalog: &mut Catalog,
    superseded: VolumeId,
    base: FilesetId,
    base_time: DateTime<Utc>,
    predecessor: Option<FilesetId>,
    control_files: Vec<ControlFile>,
    cancel: &CancellationToken,
) -> Result<(ClosedFilelist, SyntheticFilelist)> {
    let file_time = probe_unused_filename(catalog, base_time);
    let mut writer = FilelistWriter::new(file_time);
    let volume_id = catalog.register_volume(writer.remote_name(), VolumeType::Files)?;
    writer.volume_id = Some(volume_id);

    // Only ever created after an interruption, so never a full backup.
    writer.create_fileset_file(false);
    let fileset_id = catalog.create_fileset(file_time);
    catalog.set_fileset_partial(fileset_id, true)?;
    catalog.link_fileset_to_volume(fileset_id, volume_id)?;
    let entries = catalog.append_files_from_previous_set(fileset_id, predecessor, base)?;

    writer.write_fileset(catalog, fileset_id)?;
    for file in control_files {
        writer.add_control_file(file);
    }
    let closed = writer.close()?;
    catalog.seal_fileset(fileset_id)?;

    cancel.rendezvous("synthetic filelist commit")?;

    catalog.update_volume_state(
        volume_id,
        VolumeState::Uploading,
        Some(closed.size()),
        Some(closed.hash.clone()),
    )?;
    // Cleanup reconciles against the remote listing, so this is safe even if
    // the old filelist never reached the backend.
    catalog.update_volume_state(superseded, VolumeState::Deleting, None, None)?;

    let synthetic = SyntheticFilelist {
        fileset_id,
        timestamp: file_time,
        volume_id,
        volume_name: closed.name.clone(),
        base,
        predecessor,
        entries,
    };
    Ok((closed, synthetic))
}
