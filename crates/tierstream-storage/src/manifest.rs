//! Partition Manifest
//!
//! Per-partition catalog of the segments offloaded to object storage. Two
//! offset spaces appear here:
//!
//! - **raw offsets**: the log's internal numbering, counting every record
//!   including the ones inside control batches
//! - **kafka offsets**: the consumer-visible numbering, data records only
//!
//! Their difference at any point is the *delta*, non-decreasing along the
//! log. Each segment records the delta at its base offset so a reader can
//! translate without scanning earlier segments.
//!
//! Segments in a manifest are contiguous and non-overlapping; lookup by raw
//! offset is a `BTreeMap` floor search. The read path treats a manifest as
//! immutable for the duration of one read.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Internal log offset; counts every record.
pub type RawOffset = i64;

/// Consumer-visible offset; counts data records only.
pub type KafkaOffset = i64;

/// Difference raw − kafka at a point in the log.
pub type DeltaOffset = i64;

/// Translate a raw offset given the delta in effect at that point.
pub fn raw_to_kafka(raw: RawOffset, delta: DeltaOffset) -> KafkaOffset {
    raw - delta
}

/// Topic/partition identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ntp {
    pub topic: String,
    pub partition: u32,
}

impl Ntp {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Ntp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// One entry of a segment's sparse seek index: the file position of the
/// batch that starts at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub offset: RawOffset,
    pub file_pos: u64,
}

/// Metadata for one remote segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Raw offset of the first record in the segment
    pub base_offset: RawOffset,

    /// Raw offset of the last record in the segment
    pub committed_offset: RawOffset,

    /// Delta in effect at `base_offset`
    pub delta_offset: DeltaOffset,

    /// Term of the leader that sealed the segment
    pub segment_term: i64,

    /// Segment file size in bytes
    pub size_bytes: u64,

    /// Sparse raw-offset → file-position index
    #[serde(default)]
    pub index: Vec<IndexEntry>,
}

impl SegmentMeta {
    /// Kafka offset of the segment's first record.
    pub fn base_kafka_offset(&self) -> KafkaOffset {
        raw_to_kafka(self.base_offset, self.delta_offset)
    }

    pub fn contains(&self, raw: RawOffset) -> bool {
        self.base_offset <= raw && raw <= self.committed_offset
    }

    /// Object-store key for this segment under the given partition.
    pub fn object_key(&self, ntp: &Ntp) -> String {
        format!(
            "{}/{}_{}/{}-{}-v1.log",
            ntp.topic, ntp.partition, self.segment_term, self.base_offset, self.segment_term
        )
    }

    /// File position to start scanning from when looking for `raw`:
    /// the greatest index entry at or below it, or the start of the file.
    pub fn seek_position(&self, raw: RawOffset) -> u64 {
        let idx = self.index.partition_point(|e| e.offset <= raw);
        if idx == 0 {
            0
        } else {
            self.index[idx - 1].file_pos
        }
    }
}

/// Ordered catalog of a partition's remote segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionManifest {
    ntp: Ntp,
    segments: BTreeMap<RawOffset, SegmentMeta>,
}

impl PartitionManifest {
    pub fn new(ntp: Ntp) -> Self {
        Self {
            ntp,
            segments: BTreeMap::new(),
        }
    }

    pub fn ntp(&self) -> &Ntp {
        &self.ntp
    }

    /// Append a segment, enforcing contiguity with the previous one.
    pub fn push(&mut self, meta: SegmentMeta) -> Result<()> {
        if meta.committed_offset < meta.base_offset {
            return Err(Error::Manifest(format!(
                "segment [{}, {}] is inverted",
                meta.base_offset, meta.committed_offset
            )));
        }
        if let Some((_, last)) = self.segments.iter().next_back() {
            if meta.base_offset != last.committed_offset + 1 {
                return Err(Error::Manifest(format!(
                    "segment base {} does not follow previous committed {}",
                    meta.base_offset, last.committed_offset
                )));
            }
            if meta.delta_offset < last.delta_offset {
                return Err(Error::Manifest(format!(
                    "delta went backwards: {} after {}",
                    meta.delta_offset, last.delta_offset
                )));
            }
        }
        self.segments.insert(meta.base_offset, meta);
        Ok(())
    }

    /// Segment whose raw offset range contains `raw`, if any. O(log n).
    pub fn segment_containing(&self, raw: RawOffset) -> Option<&SegmentMeta> {
        self.segments
            .range(..=raw)
            .next_back()
            .map(|(_, meta)| meta)
            .filter(|meta| meta.contains(raw))
    }

    pub fn first_segment(&self) -> Option<&SegmentMeta> {
        self.segments.values().next()
    }

    pub fn last_segment(&self) -> Option<&SegmentMeta> {
        self.segments.values().next_back()
    }

    /// Segments in base-offset order.
    pub fn segments(&self) -> impl DoubleEndedIterator<Item = &SegmentMeta> {
        self.segments.values()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
