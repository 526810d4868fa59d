//! Core Types for tierstream
//!
//! This crate defines the wire-level building blocks shared by the broker's
//! storage and read paths:
//!
//! - [`Record`]: a single message in a partition
//! - [`batch`]: the on-disk record batch framing (61-byte header + varint body)
//! - [`varint`]: zigzag/varint codecs used by the batch body format
//! - [`Error`]: framing and integrity errors
//!
//! Segment files are a plain concatenation of framed batches, so any
//! component that can read one batch can stream a whole segment. The framing
//! is self-describing: each batch carries its own length and checksums, which
//! is what lets the read path resume at an arbitrary byte position taken from
//! a sparse offset index.

pub mod batch;
pub mod error;
pub mod record;
pub mod varint;

pub use batch::{Batch, BatchHeader, BatchType, HEADER_SIZE};
pub use error::{Error, Result};
pub use record::Record;
