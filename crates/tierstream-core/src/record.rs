//! Record Data Structure
//!
//! A record is one message in a partition: an offset, a timestamp, an
//! optional key and a payload. Offsets here are *log* offsets, the broker's
//! internal numbering that counts every record, including the records inside
//! control batches. The consumer-visible numbering is derived from these by
//! the read path's offset translation.
//!
//! `bytes::Bytes` keeps keys and values zero-copy when records are sliced
//! out of a decoded batch body.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single record in a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Log offset of this record within the partition
    pub offset: i64,

    /// Timestamp in milliseconds since epoch
    pub timestamp: i64,

    /// Optional key
    pub key: Option<Bytes>,

    /// Value (payload)
    pub value: Bytes,
}

impl Record {
    pub fn new(offset: i64, timestamp: i64, key: Option<Bytes>, value: Bytes) -> Self {
        Self {
            offset,
            timestamp,
            key,
            value,
        }
    }

    /// Payload size of this record: key plus value bytes.
    pub fn payload_size(&self) -> usize {
        self.key.as_ref().map(|k| k.len()).unwrap_or(0) + self.value.len()
    }
}
