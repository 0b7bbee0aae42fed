use keel_types::error::{BackendErrorKind, KeelError};

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

/// Wrap an I/O failure from backend operation `op` on `key` with its
/// transient/fatal classification.
pub fn classify_io(op: &'static str, key: &str, err: std::io::Error) -> KeelError {
    let kind = if is_retryable_io(&err) {
        BackendErrorKind::Transient
    } else {
        BackendErrorKind::Fatal
    };
    KeelError::backend(kind, op, key, err)
}
