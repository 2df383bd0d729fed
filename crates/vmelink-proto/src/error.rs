use crate::wire::StackCommandType;

/// Errors that can occur while decoding or sizing command buffers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The buffer contains a word whose super command tag is undefined.
    #[error("unknown super command tag 0x{tag:04x} at word {index}")]
    UnknownSuperTag { tag: u16, index: usize },

    /// The buffer contains a word whose stack command tag is undefined.
    #[error("unknown stack command tag 0x{tag:02x} at word {index}")]
    UnknownStackTag { tag: u8, index: usize },

    /// A multi-word command starts at `index` but the buffer ends before
    /// all of its words.
    #[error("buffer truncated inside the command starting at word {index}")]
    Truncated { index: usize },

    /// A stack buffer ended without a StackEnd marker.
    #[error("stack buffer ended without a StackEnd marker")]
    MissingTerminator,

    /// The command is a host-side extension without a wire encoding.
    #[error("{0:?} commands cannot be encoded into an uploaded stack")]
    NotUploadable(StackCommandType),

    /// The data width field holds a value outside the defined set.
    #[error("invalid data width field 0x{value:04x} at word {index}")]
    InvalidDataWidth { value: u16, index: usize },

    /// A textual stack command could not be parsed.
    #[error("cannot parse stack command from {0:?}")]
    InvalidCommandString(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;
