//! Record Batch Framing
//!
//! The on-disk unit of a segment file. A segment is a plain concatenation of
//! framed batches; each batch is a 61-byte fixed header followed by a
//! variable-length body of varint delta-encoded records.
//!
//! ## Header layout (big-endian)
//!
//! ```text
//! offset  size  field
//!      0     4  header_crc       CRC32 of header bytes 4..61
//!      4     4  size_bytes       total batch size, header included
//!      8     8  base_offset      log offset of the first record
//!     16     8  term             leader term that produced the batch
//!     24     1  batch_type       data / configuration / checkpoint / tx marker
//!     25     4  crc              CRC32 of the body
//!     29     2  attributes
//!     31     4  record_count
//!     35     8  first_timestamp
//!     43     8  max_timestamp
//!     51     8  producer_id
//!     59     2  producer_epoch
//! ```
//!
//! The two checksums split responsibilities: `header_crc` lets a streaming
//! parser reject a bad frame before trusting `size_bytes` enough to skip
//! ahead, and `crc` covers the body independently so a valid header over a
//! torn body is still detected.
//!
//! ## Body format
//!
//! Per record: offset delta (zigzag varint, relative to the previous record,
//! zero for the first), timestamp delta (zigzag varint, same base rule),
//! key length (varint, zero meaning no key), key bytes, value length
//! (varint), value bytes. Record offsets within a batch are contiguous.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::record::Record;
use crate::varint;

/// Size of the fixed batch header in bytes.
pub const HEADER_SIZE: usize = 61;

/// Upper bound on a single batch, header included.
pub const MAX_BATCH_SIZE: usize = 128 * 1024 * 1024;

/// Kind of payload a batch carries.
///
/// Only `Data` batches are visible to consumers; every other kind occupies
/// log offsets without contributing consumer offsets, which is what the
/// read path's delta accounting is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchType {
    /// Regular records, consumer-visible.
    Data,
    /// Replication configuration change.
    Configuration,
    /// Internal checkpoint marker.
    Checkpoint,
    /// Transaction commit/abort marker.
    TxMarker,
    /// Unrecognized type, preserved verbatim.
    Unknown(i8),
}

impl BatchType {
    pub fn from_i8(value: i8) -> Self {
        match value {
            1 => BatchType::Data,
            2 => BatchType::Configuration,
            3 => BatchType::Checkpoint,
            4 => BatchType::TxMarker,
            other => BatchType::Unknown(other),
        }
    }

    pub fn as_i8(&self) -> i8 {
        match self {
            BatchType::Data => 1,
            BatchType::Configuration => 2,
            BatchType::Checkpoint => 3,
            BatchType::TxMarker => 4,
            BatchType::Unknown(other) => *other,
        }
    }

    /// Whether records in this batch count toward consumer offsets.
    pub fn is_data(&self) -> bool {
        matches!(self, BatchType::Data)
    }
}

/// Fixed-size batch header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHeader {
    pub size_bytes: u32,
    pub base_offset: i64,
    pub term: i64,
    pub batch_type: BatchType,
    pub crc: u32,
    pub attributes: u16,
    pub record_count: u32,
    pub first_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
}

impl BatchHeader {
    /// Log offset of the last record in the batch.
    pub fn last_offset(&self) -> i64 {
        self.base_offset + self.record_count as i64 - 1
    }

    /// Body length implied by `size_bytes`.
    pub fn body_len(&self) -> usize {
        self.size_bytes as usize - HEADER_SIZE
    }

    /// Serialize the header, computing `header_crc` over the tail.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut tail = BytesMut::with_capacity(HEADER_SIZE - 4);
        self.encode_tail(&mut tail);
        buf.put_u32(crc32fast::hash(&tail));
        buf.extend_from_slice(&tail);
    }

    fn encode_tail(&self, buf: &mut BytesMut) {
        buf.put_u32(self.size_bytes);
        buf.put_i64(self.base_offset);
        buf.put_i64(self.term);
        buf.put_i8(self.batch_type.as_i8());
        buf.put_u32(self.crc);
        buf.put_u16(self.attributes);
        buf.put_u32(self.record_count);
        buf.put_i64(self.first_timestamp);
        buf.put_i64(self.max_timestamp);
        buf.put_i64(self.producer_id);
        buf.put_i16(self.producer_epoch);
    }

    /// Parse and validate a header from exactly [`HEADER_SIZE`] bytes.
    ///
    /// Verifies `header_crc` and the size bounds; the body checksum is
    /// checked later, once the body has been read.
    pub fn decode(data: &[u8]) -> Result<BatchHeader> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Truncated {
                needed: HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut cursor = &data[..HEADER_SIZE];
        let header_crc = cursor.get_u32();
        if header_crc != crc32fast::hash(&data[4..HEADER_SIZE]) {
            return Err(Error::HeaderCrcMismatch);
        }

        let header = BatchHeader {
            size_bytes: cursor.get_u32(),
            base_offset: cursor.get_i64(),
            term: cursor.get_i64(),
            batch_type: BatchType::from_i8(cursor.get_i8()),
            crc: cursor.get_u32(),
            attributes: cursor.get_u16(),
            record_count: cursor.get_u32(),
            first_timestamp: cursor.get_i64(),
            max_timestamp: cursor.get_i64(),
            producer_id: cursor.get_i64(),
            producer_epoch: cursor.get_i16(),
        };

        if (header.size_bytes as usize) < HEADER_SIZE
            || header.size_bytes as usize > MAX_BATCH_SIZE
        {
            return Err(Error::InvalidBatch(format!(
                "batch size {} outside [{}, {}]",
                header.size_bytes, HEADER_SIZE, MAX_BATCH_SIZE
            )));
        }
        if header.record_count == 0 {
            return Err(Error::InvalidBatch("batch with zero records".to_string()));
        }

        Ok(header)
    }
}

/// A decoded record batch: header plus its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub header: BatchHeader,
    pub records: Vec<Record>,
}

impl Batch {
    /// Assemble a batch from records with contiguous offsets.
    ///
    /// Computes timestamps, checksums and sizes from the records; the first
    /// record's offset becomes the batch base offset.
    pub fn build(
        term: i64,
        batch_type: BatchType,
        producer_id: i64,
        records: Vec<Record>,
    ) -> Result<Batch> {
        let first = records
            .first()
            .ok_or_else(|| Error::InvalidBatch("batch with zero records".to_string()))?;
        let base_offset = first.offset;
        for (i, rec) in records.iter().enumerate() {
            if rec.offset != base_offset + i as i64 {
                return Err(Error::InvalidBatch(format!(
                    "non-contiguous record offset {} at position {}",
                    rec.offset, i
                )));
            }
        }

        let first_timestamp = first.timestamp;
        let max_timestamp = records.iter().map(|r| r.timestamp).max().unwrap_or(0);

        let body = encode_records(&records, base_offset, first_timestamp);
        let header = BatchHeader {
            size_bytes: (HEADER_SIZE + body.len()) as u32,
            base_offset,
            term,
            batch_type,
            crc: crc32fast::hash(&body),
            attributes: 0,
            record_count: records.len() as u32,
            first_timestamp,
            max_timestamp,
            producer_id,
            producer_epoch: 0,
        };

        Ok(Batch { header, records })
    }

    pub fn base_offset(&self) -> i64 {
        self.header.base_offset
    }

    pub fn last_offset(&self) -> i64 {
        self.header.last_offset()
    }

    /// Total framed size of this batch in bytes.
    pub fn size_bytes(&self) -> usize {
        self.header.size_bytes as usize
    }

    /// Serialize header and body.
    pub fn encode(&self, buf: &mut BytesMut) {
        self.header.encode(buf);
        let body = encode_records(
            &self.records,
            self.header.base_offset,
            self.header.first_timestamp,
        );
        buf.extend_from_slice(&body);
    }

    /// Decode a body against an already-validated header.
    ///
    /// Verifies the body CRC, decodes exactly `record_count` records and
    /// rejects trailing garbage.
    pub fn decode_body(header: BatchHeader, body: &[u8]) -> Result<Batch> {
        if body.len() != header.body_len() {
            return Err(Error::Truncated {
                needed: header.body_len(),
                available: body.len(),
            });
        }
        if crc32fast::hash(body) != header.crc {
            return Err(Error::CrcMismatch);
        }

        let mut cursor = body;
        let mut records = Vec::with_capacity(header.record_count as usize);
        let mut current_offset = header.base_offset;
        let mut current_timestamp = header.first_timestamp;

        for _ in 0..header.record_count {
            let offset_delta = varint::decode_varint(&mut cursor)?;
            current_offset += offset_delta;

            let timestamp_delta = varint::decode_varint(&mut cursor)?;
            current_timestamp += timestamp_delta;

            let key_len = varint::decode_varint_u64(&mut cursor)? as usize;
            let key = if key_len > 0 {
                if cursor.remaining() < key_len {
                    return Err(Error::Truncated {
                        needed: key_len,
                        available: cursor.remaining(),
                    });
                }
                let key = Bytes::copy_from_slice(&cursor[..key_len]);
                cursor.advance(key_len);
                Some(key)
            } else {
                None
            };

            let value_len = varint::decode_varint_u64(&mut cursor)? as usize;
            if cursor.remaining() < value_len {
                return Err(Error::Truncated {
                    needed: value_len,
                    available: cursor.remaining(),
                });
            }
            let value = Bytes::copy_from_slice(&cursor[..value_len]);
            cursor.advance(value_len);

            records.push(Record::new(current_offset, current_timestamp, key, value));
        }

        if cursor.has_remaining() {
            return Err(Error::InvalidBatch(format!(
                "{} trailing bytes after last record",
                cursor.remaining()
            )));
        }

        Ok(Batch { header, records })
    }
}

fn encode_records(records: &[Record], base_offset: i64, first_timestamp: i64) -> BytesMut {
    let mut buf = BytesMut::new();
    let mut prev_offset = base_offset;
    let mut prev_timestamp = first_timestamp;

    for record in records {
        varint::encode_varint(&mut buf, record.offset - prev_offset);
        varint::encode_varint(&mut buf, record.timestamp - prev_timestamp);
        prev_offset = record.offset;
        prev_timestamp = record.timestamp;

        match &record.key {
            Some(key) => {
                varint::encode_varint_u64(&mut buf, key.len() as u64);
                buf.extend_from_slice(key);
            }
            None => varint::encode_varint_u64(&mut buf, 0),
        }
        varint::encode_varint_u64(&mut buf, record.value.len() as u64);
        buf.extend_from_slice(&record.value);
    }

    buf
}
