use std::time::Duration;

use keel_types::error::{KeelError, Result};

pub(super) fn default_catalog_path() -> String {
    "keel-catalog.bin".to_string()
}

pub(super) fn default_block_size() -> u32 {
    100 * 1024 // 100 KiB
}

pub(super) fn default_volume_size() -> u64 {
    50 * 1024 * 1024 // 50 MiB
}

pub(super) fn default_upload_concurrency() -> usize {
    4
}

pub(super) fn default_scan_readahead() -> usize {
    4
}

pub(super) fn default_case_sensitive_paths() -> bool {
    !cfg!(any(windows, target_os = "macos"))
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_buffer_capacity() -> usize {
    30
}

pub(super) fn default_active_buffer_capacity() -> usize {
    5000
}

pub(super) fn default_subscription_timeout() -> String {
    "30s".to_string()
}

/// Parse a simple duration string like "30s", "5m", "4h", or "2d".
/// A bare number is read as seconds.
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    let (num_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        Some(_) => (input, None),
        None => return Err(KeelError::Config("duration must not be empty".into())),
    };

    let value: u64 = num_part
        .parse()
        .map_err(|_| KeelError::Config(format!("invalid duration value: '{raw}'")))?;

    let secs = match unit {
        Some('s') | Some('S') | None => value,
        Some('m') | Some('M') => value.saturating_mul(60),
        Some('h') | Some('H') => value.saturating_mul(60 * 60),
        Some('d') | Some('D') => value.saturating_mul(60 * 60 * 24),
        Some(other) => {
            return Err(KeelError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use s/m/h/d)"
            )));
        }
    };

    if secs == 0 {
        return Err(KeelError::Config(
            "duration must be greater than zero".into(),
        ));
    }

    Ok(Duration::from_secs(secs))
}
