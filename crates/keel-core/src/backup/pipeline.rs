//! Parallel directory scan.
//!
//! Walk thread → bounded work channel → N read/hash workers → bounded result
//! channel → reorder buffer → the session, which stays the only catalog
//! writer. Entries are packed in walk order regardless of which worker
//! finished first.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crossbeam_channel::Receiver;
use keel_types::error::{KeelError, Result};
use tracing::{debug, warn};

use super::prepare::{PreparedContent, PreparedEntry};
use super::walk::{is_soft_io_error, walk_stage};
use super::{BackupSession, EntryMetadata};
use crate::filter::PathFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ScanKind {
    Folder,
    Symlink,
    File,
}

/// One walked entry, numbered in walk order.
#[derive(Debug)]
pub(super) struct ScanJob {
    pub(super) seq: usize,
    pub(super) path: String,
    pub(super) abs: PathBuf,
    pub(super) kind: ScanKind,
    pub(super) metadata: EntryMetadata,
}

pub(super) enum ScanResult {
    /// `None` when the entry vanished or became unreadable.
    Ok(usize, Option<Box<PreparedEntry>>),
    /// Delivered in order so earlier entries are recorded first.
    WorkerErr(usize, KeelError),
    /// Fails the scan immediately.
    WalkErr(KeelError),
}

/// Read and hash one entry off the session thread.
fn prepare_job(job: ScanJob, block_size: usize) -> Result<Option<PreparedEntry>> {
    match job.kind {
        ScanKind::Folder => {
            PreparedEntry::new(job.path, PreparedContent::Folder, &job.metadata, block_size)
                .map(Some)
        }
        ScanKind::Symlink => {
            let target = match fs::read_link(&job.abs) {
                Ok(target) => target,
                Err(e) if is_soft_io_error(&e) => {
                    warn!(path = %job.path, error = %e, "skipping unreadable symlink");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            let metadata = EntryMetadata {
                link_target: Some(target.to_string_lossy().into_owned()),
                ..job.metadata
            };
            PreparedEntry::new(job.path, PreparedContent::Symlink, &metadata, block_size)
                .map(Some)
        }
        ScanKind::File => {
            let data = match fs::read(&job.abs) {
                Ok(data) => data,
                Err(e) if is_soft_io_error(&e) => {
                    warn!(path = %job.path, error = %e, "skipping unreadable file");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            PreparedEntry::file(job.path, data, &job.metadata, block_size).map(Some)
        }
    }
}

impl BackupSession<'_> {
    pub(super) fn run_scan_pipeline(
        &mut self,
        root: &Path,
        filter: &(dyn PathFilter + Sync),
    ) -> Result<usize> {
        let num_workers = self.config.effective_scan_workers();
        let block_size = self.config.block_size as usize;
        let work_cap = num_workers * 2;
        let result_cap = num_workers + self.config.scan_readahead;
        let cancel = self.cancel.clone();
        debug!(workers = num_workers, root = %root.display(), "starting scan");

        std::thread::scope(|s| {
            let (work_tx, work_rx) = crossbeam_channel::bounded::<ScanJob>(work_cap);
            let (result_tx, result_rx) = crossbeam_channel::bounded::<ScanResult>(result_cap);

            let walk_result_tx = result_tx.clone();
            let cancel = &cancel;
            s.spawn(move || walk_stage(root, filter, cancel, &work_tx, &walk_result_tx));

            for _ in 0..num_workers {
                let rx = work_rx.clone();
                let tx = result_tx.clone();
                s.spawn(move || {
                    for job in rx {
                        let seq = job.seq;
                        let msg = match prepare_job(job, block_size) {
                            Ok(entry) => ScanResult::Ok(seq, entry.map(Box::new)),
                            Err(e) => ScanResult::WorkerErr(seq, e),
                        };
                        if tx.send(msg).is_err() {
                            return;
                        }
                    }
                });
            }
            // Channels close once every clone is gone.
            drop(work_rx);
            drop(result_tx);

            self.consume_scan_results(result_rx)
        })
    }

    /// Record results in walk order. Returning early drops the receiver,
    /// which stops the workers and then the walk.
    fn consume_scan_results(&mut self, results: Receiver<ScanResult>) -> Result<usize> {
        let mut next_expected = 0usize;
        let mut pending: BTreeMap<usize, Result<Option<Box<PreparedEntry>>>> = BTreeMap::new();
        let mut added = 0usize;

        for msg in &results {
            match msg {
                ScanResult::Ok(seq, entry) => {
                    pending.insert(seq, Ok(entry));
                }
                ScanResult::WorkerErr(seq, e) => {
                    pending.insert(seq, Err(e));
                }
                ScanResult::WalkErr(e) => return Err(e),
            }
            while let Some(result) = pending.remove(&next_expected) {
                next_expected += 1;
                if let Some(entry) = result? {
                    self.add_prepared(*entry)?;
                    added += 1;
                }
            }
        }
        // A cancelled walk stops early without an error of its own.
        self.rendezvous("scan")?;
        Ok(added)
    }
}
