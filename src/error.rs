use std::io;
use std::time::Duration;

/// Failures that are specific to this crate. Public operations return `anyhow::Result`, and
///  code that needs to react to a specific failure matches on this type via `downcast_ref`.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A buffer could not be parsed as a batch frame
    #[error("malformed batch frame: {0}")]
    MalformedFrame(String),

    #[error("timed out after {timeout:?} waiting to {operation}")]
    Timeout {
        timeout: Duration,
        operation: &'static str,
    },

    /// An operation was called in a state that does not allow it, e.g. sending on a sender that
    ///  was never connected
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
}

impl TransportError {
    pub fn malformed(msg: impl Into<String>) -> TransportError {
        TransportError::MalformedFrame(msg.into())
    }
}

/// Socket errors that indicate a broken connection rather than a broken configuration or a bug:
///  reconnecting is a reasonable reaction to them.
pub fn is_transient_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Checks the entire chain of causes for a transient socket error
pub fn is_transient(e: &anyhow::Error) -> bool {
    e.chain()
        .filter_map(|cause| cause.downcast_ref::<io::Error>())
        .any(is_transient_io_error)
}
