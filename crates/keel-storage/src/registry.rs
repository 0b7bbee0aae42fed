use std::collections::HashMap;

use keel_types::error::{KeelError, Result};
use tracing::debug;

use crate::{LocalBackend, MemoryBackend, StorageBackend};

/// Constructor for one backend kind. Receives the location part of the URL
/// (everything after `scheme://`).
pub type BackendFactory = fn(&str) -> Result<Box<dyn StorageBackend>>;

/// A repository URL split into its protocol key and location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub scheme: String,
    pub location: String,
}

/// Parse `scheme://location`. Anything without a scheme is a local path.
pub fn parse_url(url: &str) -> Result<ParsedUrl> {
    let url = url.trim();
    if url.is_empty() {
        return Err(KeelError::MissingParameter("repository url"));
    }
    match url.split_once("://") {
        Some((scheme, location)) => {
            if scheme.is_empty() {
                return Err(KeelError::Config(format!(
                    "repository url '{url}' has an empty scheme"
                )));
            }
            Ok(ParsedUrl {
                scheme: scheme.to_ascii_lowercase(),
                location: location.to_string(),
            })
        }
        None => Ok(ParsedUrl {
            scheme: "file".to_string(),
            location: url.to_string(),
        }),
    }
}

fn local_factory(location: &str) -> Result<Box<dyn StorageBackend>> {
    if location.is_empty() {
        return Err(KeelError::Config("file:// url needs a directory".into()));
    }
    Ok(Box::new(LocalBackend::new(location)?))
}

fn memory_factory(_location: &str) -> Result<Box<dyn StorageBackend>> {
    Ok(Box::new(MemoryBackend::new()))
}

/// Compile-time table from protocol key to backend constructor.
pub struct BackendRegistry {
    factories: HashMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    /// Build a registry from explicit entries. Rejects empty and duplicate keys.
    pub fn new(entries: &[(&'static str, BackendFactory)]) -> Result<Self> {
        let mut factories = HashMap::with_capacity(entries.len());
        for (key, factory) in entries {
            if key.is_empty() || key.contains("://") {
                return Err(KeelError::Config(format!(
                    "invalid backend key '{key}'"
                )));
            }
            if factories.insert(*key, *factory).is_some() {
                return Err(KeelError::Config(format!(
                    "backend key '{key}' registered twice"
                )));
            }
        }
        Ok(Self { factories })
    }

    /// Registry with the built-in `file` and `memory` backends.
    pub fn with_builtin() -> Self {
        let mut factories: HashMap<&'static str, BackendFactory> = HashMap::new();
        factories.insert("file", local_factory);
        factories.insert("memory", memory_factory);
        Self { factories }
    }

    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.factories.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Construct the backend a URL names.
    pub fn create(&self, url: &str) -> Result<Box<dyn StorageBackend>> {
        let parsed = parse_url(url)?;
        let factory = self
            .factories
            .get(parsed.scheme.as_str())
            .ok_or_else(|| KeelError::UnsupportedBackend(parsed.scheme.clone()))?;
        debug!(scheme = %parsed.scheme, location = %parsed.location, "creating backend");
        factory(&parsed.location)
    }
}

/// Build a backend from a URL using the built-in registry.
pub fn backend_from_url(url: &str) -> Result<Box<dyn StorageBackend>> {
    BackendRegistry::with_builtin().create(url)
}
