use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

/// Counters describing one backup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupResults {
    pub opened_files: u64,
    pub size_of_opened_files: u64,
    pub added_files: u64,
    pub size_of_added_files: u64,
    pub modified_files: u64,
    pub size_of_modified_files: u64,
    pub examined_files: u64,
    pub size_of_examined_files: u64,
    pub files_with_timestamp_changed: u64,
}

/// Serializes statistic updates from concurrent pipeline stages.
///
/// Each `add_*` holds the lock for its whole read-modify-write and returns
/// the state it produced.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    results: Mutex<BackupResults>,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_lock(&self, f: impl FnOnce(&mut BackupResults)) -> BackupResults {
        let mut guard: MutexGuard<'_, BackupResults> = match self.results.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
        guard.clone()
    }

    pub fn add_opened_file(&self, size: u64) -> BackupResults {
        self.with_lock(|r| {
            r.opened_files += 1;
            r.size_of_opened_files += size;
        })
    }

    pub fn add_added_file(&self, size: u64) -> BackupResults {
        self.with_lock(|r| {
            r.added_files += 1;
            r.size_of_added_files += size;
        })
    }

    pub fn add_modified_file(&self, size: u64) -> BackupResults {
        self.with_lock(|r| {
            r.modified_files += 1;
            r.size_of_modified_files += size;
        })
    }

    pub fn add_examined_file(&self, size: u64) -> BackupResults {
        self.with_lock(|r| {
            r.examined_files += 1;
            r.size_of_examined_files += size;
        })
    }

    pub fn add_timestamp_changed_file(&self) -> BackupResults {
        self.with_lock(|r| r.files_with_timestamp_changed += 1)
    }

    pub fn snapshot(&self) -> BackupResults {
        self.with_lock(|_| {})
    }
}
