use std::fmt;
use std::path::Path;

use keel_types::error::{KeelError, Result};
use tracing::debug;

use super::types::KeelConfig;

/// Load, expand and validate a YAML config file. Relative `catalog.path`
/// and `backup.control_files` are taken relative to the file's directory.
pub fn load_config(path: &Path) -> Result<KeelConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        KeelError::Config(format!("cannot read config '{}': {e}", path.display()))
    })?;
    let mut config = parse_config(&raw, path)?;
    if let Some(dir) = path.parent() {
        let catalog = Path::new(&config.catalog.path);
        if catalog.is_relative() {
            config.catalog.path = dir.join(catalog).to_string_lossy().into_owned();
        }
        for control in &mut config.backup.control_files {
            if control.is_relative() {
                *control = dir.join(&*control);
            }
        }
    }
    debug!(
        path = %path.display(),
        url = %config.repository.url,
        catalog = %config.catalog.path,
        "loaded config"
    );
    Ok(config)
}

/// Parse config text. `path` only labels error messages.
pub fn parse_config(raw: &str, path: &Path) -> Result<KeelConfig> {
    let expanded = expand_env(raw, path)?;
    let config: KeelConfig = serde_yaml::from_str(&expanded).map_err(|e| {
        KeelError::Config(format!("invalid config '{}': {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Substitute `${VAR}` with the variable's value, line by line. An unset
/// variable is an error naming the line.
fn expand_env(raw: &str, path: &Path) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    for (line_no, line) in (1..).zip(raw.split_inclusive('\n')) {
        let mut rest = line;
        while let Some(open) = rest.find("${") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            let close = after
                .find('}')
                .ok_or_else(|| placeholder_error(path, line_no, "unterminated placeholder"))?;
            let value =
                env_value(&after[..close]).map_err(|msg| placeholder_error(path, line_no, msg))?;
            out.push_str(&value);
            rest = &after[close + 1..];
        }
        out.push_str(rest);
    }
    Ok(out)
}

fn env_value(name: &str) -> std::result::Result<String, String> {
    let valid = name.starts_with(|c: char| c == '_' || c.is_ascii_alphabetic())
        && name.chars().all(|c| c == '_' || c.is_ascii_alphanumeric());
    if !valid {
        return Err(format!("invalid variable name '{name}'"));
    }
    std::env::var(name).map_err(|e| format!("${{{name}}}: {e}"))
}

fn placeholder_error(path: &Path, line: usize, message: impl fmt::Display) -> KeelError {
    KeelError::Config(format!(
        "invalid config '{}' line {line}: {message}",
        path.display()
    ))
}
