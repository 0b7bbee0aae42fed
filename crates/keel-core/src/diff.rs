//! Added/deleted/modified sets and size deltas between two filesets.
//!
//! Both sides are projected into path-sorted rows and compared with a
//! single linear merge.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use keel_types::block_hash::BlockHash;
use keel_types::error::Result;
use keel_types::ids::FilesetId;
use serde::Serialize;
use tracing::debug;

use crate::catalog::{Catalog, ElementType};
use crate::filter::PathFilter;

/// One path of one side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    pub path: String,
    /// `None` for folders and symlinks.
    pub content_hash: Option<BlockHash>,
    pub metadata_hash: BlockHash,
    /// Content length; folders and symlinks count as 0.
    pub size: u64,
    pub element_type: ElementType,
}

impl ChangeRow {
    fn same_version(&self, other: &ChangeRow) -> bool {
        self.content_hash == other.content_hash
            && self.metadata_hash == other.metadata_hash
            && self.element_type == other.element_type
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ChangeType {
    Added,
    Deleted,
    Modified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCountReport {
    pub added_folders: u64,
    pub added_symlinks: u64,
    pub added_files: u64,
    pub deleted_folders: u64,
    pub deleted_symlinks: u64,
    pub deleted_files: u64,
    pub modified_folders: u64,
    pub modified_symlinks: u64,
    pub modified_files: u64,
}

impl ChangeCountReport {
    fn bump(&mut self, change: ChangeType, element: ElementType) {
        let slot = match (change, element) {
            (ChangeType::Added, ElementType::Folder) => &mut self.added_folders,
            (ChangeType::Added, ElementType::Symlink) => &mut self.added_symlinks,
            (ChangeType::Added, ElementType::File) => &mut self.added_files,
            (ChangeType::Deleted, ElementType::Folder) => &mut self.deleted_folders,
            (ChangeType::Deleted, ElementType::Symlink) => &mut self.deleted_symlinks,
            (ChangeType::Deleted, ElementType::File) => &mut self.deleted_files,
            (ChangeType::Modified, ElementType::Folder) => &mut self.modified_folders,
            (ChangeType::Modified, ElementType::Symlink) => &mut self.modified_symlinks,
            (ChangeType::Modified, ElementType::File) => &mut self.modified_files,
        };
        *slot += 1;
    }

    pub fn total(&self, change: ChangeType) -> u64 {
        match change {
            ChangeType::Added => self.added_folders + self.added_symlinks + self.added_files,
            ChangeType::Deleted => {
                self.deleted_folders + self.deleted_symlinks + self.deleted_files
            }
            ChangeType::Modified => {
                self.modified_folders + self.modified_symlinks + self.modified_files
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSizeReport {
    pub previous_size: u64,
    pub current_size: u64,
    pub added_size: u64,
    pub deleted_size: u64,
}

/// One line of a [`ChangedFileReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedFile<'a> {
    pub change: ChangeType,
    pub element_type: ElementType,
    pub path: &'a str,
}

/// Comparison of a previous and a current projection.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    previous: Vec<ChangeRow>,
    current: Vec<ChangeRow>,
    /// Indexes into `current`, ordered by (type, path).
    added: Vec<usize>,
    /// Indexes into `previous`, ordered by (type, path).
    deleted: Vec<usize>,
    /// (previous, current) index pairs, ordered by current (type, path).
    modified: Vec<(usize, usize)>,
}

impl ChangeSet {
    /// Compare two filesets of `catalog`. With no `previous`, every current
    /// path is added.
    pub fn build(
        catalog: &Catalog,
        previous: Option<FilesetId>,
        current: FilesetId,
        filter: &dyn PathFilter,
    ) -> Result<Self> {
        let previous_rows = match previous {
            Some(id) => project_fileset(catalog, id, filter)?,
            None => Vec::new(),
        };
        let current_rows = project_fileset(catalog, current, filter)?;
        debug!(
            previous = ?previous,
            current = %current,
            previous_rows = previous_rows.len(),
            current_rows = current_rows.len(),
            "comparing filesets"
        );
        Ok(Self::from_sorted(previous_rows, current_rows))
    }

    /// Compare externally supplied rows. A later row for a path replaces an
    /// earlier one on the same side.
    pub fn from_rows(
        previous: impl IntoIterator<Item = ChangeRow>,
        current: impl IntoIterator<Item = ChangeRow>,
        filter: &dyn PathFilter,
    ) -> Self {
        let previous = select_rows(sorted_unique(previous), filter);
        let current = select_rows(sorted_unique(current), filter);
        Self::from_sorted(previous, current)
    }

    fn from_sorted(previous: Vec<ChangeRow>, current: Vec<ChangeRow>) -> Self {
        let mut added = Vec::new();
        let mut deleted = Vec::new();
        let mut modified = Vec::new();

        let (mut i, mut j) = (0usize, 0usize);
        loop {
            match (previous.get(i), current.get(j)) {
                (Some(p), Some(c)) => match p.path.cmp(&c.path) {
                    Ordering::Less => {
                        deleted.push(i);
                        i += 1;
                    }
                    Ordering::Greater => {
                        added.push(j);
                        j += 1;
                    }
                    Ordering::Equal => {
                        if !p.same_version(c) {
                            modified.push((i, j));
                        }
                        i += 1;
                        j += 1;
                    }
                },
                (Some(_), None) => {
                    deleted.push(i);
                    i += 1;
                }
                (None, Some(_)) => {
                    added.push(j);
                    j += 1;
                }
                (None, None) => break,
            }
        }

        // Rows are path-sorted, so a stable sort by type yields (type, path).
        added.sort_by_key(|&j| current[j].element_type);
        deleted.sort_by_key(|&i| previous[i].element_type);
        modified.sort_by_key(|&(_, j)| current[j].element_type);

        Self {
            previous,
            current,
            added,
            deleted,
            modified,
        }
    }

    pub fn previous_rows(&self) -> &[ChangeRow] {
        &self.previous
    }

    pub fn current_rows(&self) -> &[ChangeRow] {
        &self.current
    }

    pub fn added_paths(&self) -> impl Iterator<Item = &str> {
        self.added.iter().map(|&j| self.current[j].path.as_str())
    }

    pub fn deleted_paths(&self) -> impl Iterator<Item = &str> {
        self.deleted.iter().map(|&i| self.previous[i].path.as_str())
    }

    pub fn modified_paths(&self) -> impl Iterator<Item = &str> {
        self.modified
            .iter()
            .map(|&(_, j)| self.current[j].path.as_str())
    }

    /// Counts per change and element type. Modified paths count under their
    /// current type.
    pub fn change_count_report(&self) -> ChangeCountReport {
        let mut report = ChangeCountReport::default();
        for &j in &self.added {
            report.bump(ChangeType::Added, self.current[j].element_type);
        }
        for &i in &self.deleted {
            report.bump(ChangeType::Deleted, self.previous[i].element_type);
        }
        for &(_, j) in &self.modified {
            report.bump(ChangeType::Modified, self.current[j].element_type);
        }
        report
    }

    pub fn change_size_report(&self) -> ChangeSizeReport {
        ChangeSizeReport {
            previous_size: self.previous.iter().map(|r| r.size).sum(),
            current_size: self.current.iter().map(|r| r.size).sum(),
            added_size: self.added.iter().map(|&j| self.current[j].size).sum(),
            deleted_size: self.deleted.iter().map(|&i| self.previous[i].size).sum(),
        }
    }

    /// Added, then deleted, then modified paths, each ordered by element
    /// type (folders, symlinks, files) then path.
    pub fn changed_file_report(&self) -> ChangedFileReport<'_> {
        ChangedFileReport {
            set: self,
            change: Some(ChangeType::Added),
            pos: 0,
        }
    }
}

/// Iterator over every change of a [`ChangeSet`].
#[derive(Debug, Clone)]
pub struct ChangedFileReport<'a> {
    set: &'a ChangeSet,
    change: Option<ChangeType>,
    pos: usize,
}

impl<'a> Iterator for ChangedFileReport<'a> {
    type Item = ChangedFile<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let set = self.set;
        loop {
            let change = self.change?;
            let row = match change {
                ChangeType::Added => set.added.get(self.pos).map(|&j| &set.current[j]),
                ChangeType::Deleted => set.deleted.get(self.pos).map(|&i| &set.previous[i]),
                ChangeType::Modified => set.modified.get(self.pos).map(|&(_, j)| &set.current[j]),
            };
            match row {
                Some(row) => {
                    self.pos += 1;
                    return Some(ChangedFile {
                        change,
                        element_type: row.element_type,
                        path: row.path.as_str(),
                    });
                }
                None => {
                    self.pos = 0;
                    self.change = match change {
                        ChangeType::Added => Some(ChangeType::Deleted),
                        ChangeType::Deleted => Some(ChangeType::Modified),
                        ChangeType::Modified => None,
                    };
                }
            }
        }
    }
}

fn sorted_unique(rows: impl IntoIterator<Item = ChangeRow>) -> Vec<ChangeRow> {
    rows.into_iter()
        .map(|row| (row.path.clone(), row))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect()
}

/// Keep the rows `filter` admits. An explicit case-sensitive path set is a
/// membership test; anything else is matched row by row.
fn select_rows(rows: Vec<ChangeRow>, filter: &dyn PathFilter) -> Vec<ChangeRow> {
    if filter.is_empty() {
        return rows;
    }
    match filter.path_set() {
        Some((paths, include)) => rows
            .into_iter()
            .filter(|row| paths.contains(&row.path) == include)
            .collect(),
        None => rows
            .into_iter()
            .filter(|row| filter.matches(&row.path))
            .collect(),
    }
}

/// Path-sorted projection of one fileset.
fn project_fileset(
    catalog: &Catalog,
    fileset: FilesetId,
    filter: &dyn PathFilter,
) -> Result<Vec<ChangeRow>> {
    let entries = catalog.fileset_entries(fileset)?;
    let mut rows = Vec::with_capacity(entries.len());
    for file_id in entries.values() {
        let resolved = catalog.resolve_file(*file_id)?;
        rows.push(ChangeRow {
            path: resolved.file.path.clone(),
            content_hash: resolved.content.map(|bs| bs.full_hash),
            metadata_hash: resolved.metadata.full_hash,
            size: resolved.content.map_or(0, |bs| bs.length),
            element_type: resolved.file.content.element_type(),
        });
    }
    Ok(select_rows(rows, filter))
}
