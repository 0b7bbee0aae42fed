use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crossbeam_channel::Sender;
use keel_types::error::{KeelError, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::pipeline::{ScanJob, ScanKind, ScanResult};
use super::{BackupSession, EntryMetadata};
use crate::cancel::CancellationToken;
use crate::filter::PathFilter;

/// Returns `true` for I/O errors safe to skip (permission denied, not found).
pub(super) fn is_soft_io_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
    )
}

impl EntryMetadata {
    pub fn from_fs(meta: &fs::Metadata) -> Self {
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
        Self {
            mtime_ns,
            mode: mode_of(meta),
            link_target: None,
        }
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// Catalog path for `entry` under `root`: `/`-separated, no leading slash.
fn relative_path(root: &Path, entry: &Path) -> Option<String> {
    let rel = entry.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

impl BackupSession<'_> {
    /// Add everything under `root` that `filter` admits, reading and hashing
    /// on `scan_workers` threads. Unreadable entries are skipped with a
    /// warning. Returns the number of entries added.
    pub fn backup_directory(
        &mut self,
        root: &Path,
        filter: &(dyn PathFilter + Sync),
    ) -> Result<usize> {
        if !root.is_dir() {
            return Err(KeelError::Other(format!(
                "source directory does not exist: {}",
                root.display()
            )));
        }
        self.run_scan_pipeline(root, filter)
    }
}

/// Walk `root` in file-name order and hand numbered jobs to the workers.
/// Stops when cancelled or when the workers are gone.
pub(super) fn walk_stage(
    root: &Path,
    filter: &(dyn PathFilter + Sync),
    cancel: &CancellationToken,
    work_tx: &Sender<ScanJob>,
    result_tx: &Sender<ScanResult>,
) {
    let mut seq = 0usize;
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        if cancel.is_cancelled() {
            return;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().is_some_and(is_soft_io_error) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
            Err(e) => {
                let err = KeelError::Other(format!("walk of {} failed: {e}", root.display()));
                let _ = result_tx.send(ScanResult::WalkErr(err));
                return;
            }
        };
        let Some(path) = relative_path(root, entry.path()) else {
            continue;
        };
        if !filter.is_empty() && !filter.matches(&path) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) if e.io_error().is_some_and(is_soft_io_error) => {
                warn!(path = %path, error = %e, "skipping entry without metadata");
                continue;
            }
            Err(e) => {
                let _ = result_tx.send(ScanResult::WalkErr(KeelError::Other(format!(
                    "stat {path}: {e}"
                ))));
                return;
            }
        };
        let file_type = entry.file_type();
        let kind = if file_type.is_dir() {
            ScanKind::Folder
        } else if file_type.is_symlink() {
            ScanKind::Symlink
        } else if file_type.is_file() {
            ScanKind::File
        } else {
            debug!(path = %path, "skipping special file");
            continue;
        };
        let job = ScanJob {
            seq,
            path,
            abs: entry.into_path(),
            kind,
            metadata: EntryMetadata::from_fs(&meta),
        };
        if work_tx.send(job).is_err() {
            return;
        }
        seq += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_joins_components() {
        let root = Path::new("/data/src");
        assert_eq!(
            relative_path(root, Path::new("/data/src/a/b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(relative_path(root, root), None);
    }

    #[test]
    fn walk_numbers_admitted_entries_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a").join("x"), b"x").unwrap();
        std::fs::write(dir.path().join("b"), b"b").unwrap();
        std::fs::write(dir.path().join("c.log"), b"c").unwrap();
        let filter = crate::filter::Filter::patterns(&["*.log"], false, true).unwrap();
        let (work_tx, work_rx) = crossbeam_channel::unbounded();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();

        walk_stage(
            dir.path(),
            &filter,
            &CancellationToken::new(),
            &work_tx,
            &result_tx,
        );
        drop(work_tx);

        let jobs: Vec<ScanJob> = work_rx.iter().collect();
        let paths: Vec<_> = jobs.iter().map(|j| j.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/x", "b"]);
        assert_eq!(jobs.iter().map(|j| j.seq).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(jobs[0].kind, ScanKind::Folder);
        assert_eq!(jobs[2].kind, ScanKind::File);
        assert!(result_rx.try_recv().is_err());
    }

    #[test]
    fn cancelled_walk_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"f").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (work_tx, work_rx) = crossbeam_channel::unbounded();
        let (result_tx, _result_rx) = crossbeam_channel::unbounded();
        walk_stage(
            dir.path(),
            &crate::filter::Filter::Empty,
            &cancel,
            &work_tx,
            &result_tx,
        );
        drop(work_tx);
        assert_eq!(work_rx.iter().count(), 0);
    }

    #[test]
    fn soft_errors_are_permission_and_missing() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let other = std::io::Error::from(std::io::ErrorKind::InvalidData);
        assert!(is_soft_io_error(&denied));
        assert!(!is_soft_io_error(&other));
    }
}
