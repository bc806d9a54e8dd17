//! Error types for the canonical codec.

use thiserror::Error;

/// Decoding failures. Any of these makes the message undecodable; the peer
/// that sent it should not be asked for the same bytes again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the structure was complete.
    #[error("malformed encoding: truncated input, {needed} more bytes needed")]
    Truncated { needed: usize },

    /// A VarInt used a wider escape than its value requires.
    #[error("malformed encoding: non-minimal varint")]
    NonMinimalVarInt,

    /// A declared length exceeds the structure's hard cap.
    #[error("malformed encoding: {what} length {len} exceeds cap {cap}")]
    CapExceeded {
        what: &'static str,
        len: usize,
        cap: usize,
    },

    /// Bytes remained after decoding a whole structure.
    #[error("malformed encoding: {remaining} trailing bytes after {what}")]
    TrailingBytes {
        what: &'static str,
        remaining: usize,
    },

    /// A field held a value outside its valid domain.
    #[error("malformed encoding: invalid {what}")]
    InvalidValue { what: &'static str },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
