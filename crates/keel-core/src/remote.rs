//! Reconciling catalog volume states with what the backend actually holds.

use std::collections::HashMap;

use keel_storage::{RemoteEntry, StorageBackend};
use keel_types::error::Result;
use keel_types::volume::{VolumeState, VolumeType};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub verified: Vec<String>,
    /// Listed remotely with a size other than the recorded one.
    pub size_mismatch: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    pub filesets_removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Found remotely with the recorded size.
    pub completed: Vec<String>,
    /// Missing or truncated remotely; moved back to `Temporary`.
    pub reset: Vec<String>,
}

fn remote_sizes(backend: &dyn StorageBackend) -> Result<HashMap<String, u64>> {
    Ok(backend
        .list()?
        .into_iter()
        .map(|RemoteEntry { name, size }| (name, size))
        .collect())
}

/// Move `Uploaded` volumes confirmed by the remote listing to `Verified`.
/// A volume the backend does not list moves to `Error`.
pub fn verify_remote_volumes(
    catalog: &mut Catalog,
    backend: &dyn StorageBackend,
) -> Result<VerifyReport> {
    let remote = remote_sizes(backend)?;
    let mut report = VerifyReport::default();
    for volume in catalog.query_volumes_by_state(VolumeState::Uploaded) {
        match remote.get(&volume.name) {
            Some(size) if volume.size.map_or(true, |expected| expected == *size) => {
                catalog.update_volume_state(volume.id, VolumeState::Verified, None, None)?;
                report.verified.push(volume.name);
            }
            Some(size) => {
                warn!(
                    volume = %volume.name,
                    expected = ?volume.size,
                    actual = size,
                    "remote volume size mismatch"
                );
                report.size_mismatch.push(volume.name);
            }
            None => {
                warn!(volume = %volume.name, "uploaded volume missing from backend");
                catalog.update_volume_state(volume.id, VolumeState::Error, None, None)?;
                report.missing.push(volume.name);
            }
        }
    }
    catalog.commit("verify_remote_volumes")?;
    info!(
        verified = report.verified.len(),
        mismatched = report.size_mismatch.len(),
        missing = report.missing.len(),
        "remote verification finished"
    );
    Ok(report)
}

/// Delete every `Deleting` volume from the backend and mark it `Deleted`.
///
/// Filesets whose filelist lived in a deleted Files volume are dropped from
/// the catalog. Each volume is committed on its own, so a backend failure
/// part way keeps the progress made so far.
pub fn cleanup_deleting_volumes(
    catalog: &mut Catalog,
    backend: &dyn StorageBackend,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    for volume in catalog.query_volumes_by_state(VolumeState::Deleting) {
        backend.delete(&volume.name)?;
        catalog.update_volume_state(volume.id, VolumeState::Deleted, None, None)?;
        if volume.kind == VolumeType::Files {
            for fileset in catalog.filesets_in_volume(volume.id) {
                catalog.remove_fileset(fileset)?;
                report.filesets_removed += 1;
            }
        }
        catalog.commit("cleanup_deleting_volume")?;
        debug!(volume = %volume.name, "deleted remote volume");
        report.deleted.push(volume.name);
    }
    if !report.deleted.is_empty() {
        info!(
            volumes = report.deleted.len(),
            filesets = report.filesets_removed,
            "cleaned up deleted volumes"
        );
    }
    Ok(report)
}

/// Settle volumes left `Uploading` by an interrupted run.
pub fn reconcile_interrupted_uploads(
    catalog: &mut Catalog,
    backend: &dyn StorageBackend,
) -> Result<ReconcileReport> {
    let uploading = catalog.query_volumes_by_state(VolumeState::Uploading);
    if uploading.is_empty() {
        return Ok(ReconcileReport::default());
    }
    let remote = remote_sizes(backend)?;
    let mut report = ReconcileReport::default();
    for volume in uploading {
        let complete = match (remote.get(&volume.name), volume.size) {
            (Some(actual), Some(expected)) => *actual == expected,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if complete {
            catalog.update_volume_state(volume.id, VolumeState::Uploaded, None, None)?;
            report.completed.push(volume.name);
        } else {
            info!(volume = %volume.name, "interrupted upload did not complete, will retry");
            catalog.update_volume_state(volume.id, VolumeState::Temporary, None, None)?;
            report.reset.push(volume.name);
        }
    }
    catalog.commit("reconcile_interrupted_uploads")?;
    Ok(report)
}
