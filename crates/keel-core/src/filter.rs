use std::collections::HashSet;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use keel_types::error::{KeelError, Result};

use crate::config::BackupConfig;

/// Predicate over paths with an include or exclude sense.
pub trait PathFilter {
    /// Whether `path` passes the filter, with the include/exclude sense applied.
    fn matches(&self, path: &str) -> bool;

    /// The explicit path set and its include sense, when the filter is a
    /// finite set usable as a plain membership test.
    fn path_set(&self) -> Option<(&HashSet<String>, bool)>;

    /// An empty filter passes everything.
    fn is_empty(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub enum Filter {
    #[default]
    Empty,
    /// Exact paths.
    PathSet {
        paths: HashSet<String>,
        include: bool,
        case_sensitive: bool,
    },
    /// Glob patterns, matched row by row.
    Pattern {
        set: GlobSet,
        patterns: Vec<String>,
        include: bool,
    },
}

impl Filter {
    pub fn paths<I, S>(paths: I, include: bool, case_sensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths = paths
            .into_iter()
            .map(|p| {
                let p = p.into();
                if case_sensitive {
                    p
                } else {
                    p.to_lowercase()
                }
            })
            .collect();
        Filter::PathSet {
            paths,
            include,
            case_sensitive,
        }
    }

    pub fn patterns<S: AsRef<str>>(
        patterns: &[S],
        include: bool,
        case_sensitive: bool,
    ) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut sources = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .literal_separator(false)
                .build()
                .map_err(|e| KeelError::Config(format!("invalid filter pattern '{pattern}': {e}")))?;
            builder.add(glob);
            sources.push(pattern.to_string());
        }
        let set = builder
            .build()
            .map_err(|e| KeelError::Config(format!("invalid filter patterns: {e}")))?;
        Ok(Filter::Pattern {
            set,
            patterns: sources,
            include,
        })
    }
}

impl Filter {
    /// Path set using the configured case sensitivity.
    pub fn paths_for<I, S>(config: &BackupConfig, paths: I, include: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::paths(paths, include, config.case_sensitive_paths)
    }

    /// Glob patterns using the configured case sensitivity.
    pub fn patterns_for<S: AsRef<str>>(
        config: &BackupConfig,
        patterns: &[S],
        include: bool,
    ) -> Result<Self> {
        Self::patterns(patterns, include, config.case_sensitive_paths)
    }
}

impl PathFilter for Filter {
    fn matches(&self, path: &str) -> bool {
        match self {
            Filter::Empty => true,
            Filter::PathSet {
                paths,
                include,
                case_sensitive,
            } => {
                let hit = if *case_sensitive {
                    paths.contains(path)
                } else {
                    paths.contains(&path.to_lowercase())
                };
                hit == *include
            }
            Filter::Pattern { set, include, .. } => set.is_match(path) == *include,
        }
    }

    fn path_set(&self) -> Option<(&HashSet<String>, bool)> {
        match self {
            Filter::PathSet {
                paths,
                include,
                case_sensitive: true,
            } => Some((paths, *include)),
            _ => None,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, Filter::Empty)
    }
}
