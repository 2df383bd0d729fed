use vmelink_proto::CodecError;
use vmelink_transport::TransportError;

/// Errors surfaced by the controller's transaction layer.
///
/// Protocol errors indicate a logic or device-state bug and are never
/// retried here; retry policy for retryable transport failures belongs to
/// the caller. The only built-in retry is the best-effort backoff loop of
/// the background notification poller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Link-level failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Command buffer encode/decode failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A mirrored word of the response diverges from the request.
    #[error("mirror mismatch at word {index}: expected 0x{expected:08x}, got 0x{actual:08x}")]
    MirrorMismatch {
        index: usize,
        expected: u32,
        actual: u32,
    },

    /// The mirror response holds fewer words than the mirrored request part.
    #[error("short mirror response: expected at least {expected} words, got {actual}")]
    MirrorShortResponse { expected: usize, actual: usize },

    /// A mirror transaction was attempted with an empty request buffer.
    #[error("empty mirror request")]
    MirrorEmptyRequest,

    /// The device answered a mirror transaction with an empty buffer.
    #[error("empty mirror response")]
    MirrorEmptyResponse,

    /// A response began with a word that is no known frame header, or with
    /// a frame type the operation does not accept.
    #[error("invalid buffer header 0x{header:08x}")]
    InvalidBufferHeader { header: u32 },

    /// Device stack memory does not start with a StackStart marker.
    #[error("invalid stack header 0x{header:08x}")]
    InvalidStackHeader { header: u32 },

    /// A stack allocation or walk ran past the stack memory window.
    #[error("stack memory window exceeded")]
    StackMemoryExceeded,

    /// More stacks were requested than the device has slots.
    #[error("device stack count exceeded")]
    StackCountExceeded,

    /// The link delivered fewer words than the frame header announced.
    #[error("short read: expected {expected_words} words, got {actual_words}")]
    ShortRead {
        expected_words: usize,
        actual_words: usize,
    },

    /// A well-formed response was too small for the command's results.
    #[error("unexpected response size: expected at least {expected} words, got {actual}")]
    UnexpectedResponseSize { expected: usize, actual: usize },

    /// The VME bus did not answer the executed cycle (device timeout flag).
    #[error("no VME response")]
    NoVmeResponse,

    /// The device rejected the uploaded stack program as malformed.
    #[error("stack syntax error flagged by device")]
    StackSyntaxError,
}

impl ControllerError {
    /// True if the underlying link is down or unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ControllerError::Transport(t) if t.is_connection_error())
    }

    /// True if the operation ran into a pipe timeout and may be retried by
    /// the caller.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ControllerError::Transport(t) if t.is_timeout())
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
