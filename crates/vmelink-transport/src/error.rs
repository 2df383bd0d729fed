use vmelink_proto::Pipe;

/// Errors that can occur in bus transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link could not be established or was lost.
    #[error("connection error: {details}: {source}")]
    Connection {
        details: String,
        source: std::io::Error,
    },

    /// The peer closed the link.
    #[error("connection closed")]
    Closed,

    /// No data was transferred within the configured pipe timeout.
    #[error("timeout on {pipe:?} pipe")]
    Timeout { pipe: Pipe },

    /// A raw pipe id outside the defined set was used.
    #[error("invalid pipe id {0}")]
    InvalidPipe(u8),

    /// `connect()` was called on an established link.
    #[error("transport is already connected")]
    AlreadyConnected,

    /// `disconnect()` was called on a closed link.
    #[error("transport is already disconnected")]
    AlreadyDisconnected,

    /// An I/O error occurred on the underlying link.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for errors meaning the link itself is down or unusable.
    /// Callers use this to distinguish fatal link state from retryable
    /// per-call failures.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::Connection { .. }
                | TransportError::Closed
                | TransportError::AlreadyDisconnected
        )
    }

    /// True if the operation ran into the configured pipe timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Timeout { .. } => true,
            TransportError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_classification() {
        assert!(TransportError::Closed.is_connection_error());
        assert!(TransportError::AlreadyDisconnected.is_connection_error());
        assert!(!TransportError::Timeout { pipe: Pipe::Command }.is_connection_error());
        assert!(!TransportError::InvalidPipe(7).is_connection_error());
    }

    #[test]
    fn timeout_classification() {
        assert!(TransportError::Timeout { pipe: Pipe::Data }.is_timeout());
        assert!(TransportError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_timeout());
        assert!(!TransportError::Closed.is_timeout());
    }
}
