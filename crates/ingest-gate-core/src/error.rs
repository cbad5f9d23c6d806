//! Error types for the Ingest Gate Core.

use thiserror::Error;

/// Errors raised while decoding a data batch into messages.
///
/// All of these are client faults and surface as invalid-argument.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid meta, skip start size [{starts}], skip length size [{lengths}]")]
    MismatchedSkipArrays { starts: usize, lengths: usize },

    #[error("invalid meta, message index [{index}], messages count [{count}]")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("invalid receipt timestamp [{0}]")]
    InvalidReceiptTimestamp(String),
}

/// Errors raised by the frame codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("encoding error: {0}")]
    Encode(String),

    #[error("decoding error: {0}")]
    Decode(String),
}
