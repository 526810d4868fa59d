//! Error Types for tierstream core
//!
//! Framing and integrity errors raised while encoding or decoding batches.
//! Everything here is terminal for the batch being decoded; recovery (if
//! any) happens in the layer that owns the byte stream.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Batch header CRC mismatch")]
    HeaderCrcMismatch,

    #[error("Batch body CRC mismatch")]
    CrcMismatch,

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Truncated input: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
}
