//! Continuous Batch Parser
//!
//! Pull-driven state machine over a [`SegmentDataStream`]: read a fixed
//! header, validate it, read the body, hand the complete batch to a
//! consumer, repeat. The consumer steers the loop with [`ConsumeAck`].
//!
//! ## End of stream vs corruption
//!
//! Segment writers may pad the tail of a file; the parser tolerates an
//! unreadable trailing region of up to the configured padding window
//! (32 KiB by default) and reports it as a clean end of stream. The
//! distinction that matters:
//!
//! - header unreadable or invalid, and the whole unread remainder fits in
//!   the padding window → end of stream
//! - header unreadable or invalid anywhere else → corruption
//! - header *valid* but body truncated → always corruption, regardless of
//!   position; a real batch promised bytes the file does not have
//!
//! A parser is not restartable after an error; reposition by constructing
//! a new instance at a new byte offset.

use tierstream_core::batch::{Batch, BatchHeader, HEADER_SIZE};

use crate::error::{Error, Result};
use crate::segment::SegmentDataStream;

/// Consumer verdict for one parsed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeAck {
    /// Keep parsing.
    Continue,
    /// Stop parsing; the parser position stays after the accepted batch.
    Stop,
    /// Batch not wanted; keep parsing.
    Skip,
}

/// Receives complete batches as the parser produces them.
pub trait BatchConsumer {
    fn accept(&mut self, batch: Batch) -> ConsumeAck;
}

/// Why a `consume` call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The stream is exhausted (possibly via tolerated trailing padding).
    EndOfStream,
    /// The consumer said [`ConsumeAck::Stop`].
    Stopped,
}

/// Streaming parser over the on-disk batch framing.
pub struct BatchParser {
    stream: SegmentDataStream,
    padding_tolerance: u64,
    bytes_consumed: u64,
}

impl BatchParser {
    pub fn new(stream: SegmentDataStream, padding_tolerance: u64) -> Self {
        Self {
            stream,
            padding_tolerance,
            bytes_consumed: 0,
        }
    }

    /// Bytes of well-formed batches consumed so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// Current byte position in the segment file.
    pub fn position(&self) -> u64 {
        self.stream.position()
    }

    /// Drive the state machine until the consumer stops it, the stream
    /// ends, or a frame fails validation.
    pub async fn consume<C: BatchConsumer>(&mut self, consumer: &mut C) -> Result<ParseOutcome> {
        loop {
            let unread = self.stream.remaining();
            let header_bytes = self.stream.read_bytes(HEADER_SIZE).await?;
            if header_bytes.is_empty() {
                return Ok(ParseOutcome::EndOfStream);
            }
            if header_bytes.len() < HEADER_SIZE {
                if unread <= self.padding_tolerance {
                    return Ok(ParseOutcome::EndOfStream);
                }
                return Err(Error::DataCorruption(format!(
                    "truncated batch header: {} of {} bytes",
                    header_bytes.len(),
                    HEADER_SIZE
                )));
            }

            let header = match BatchHeader::decode(&header_bytes) {
                Ok(header) => header,
                Err(err) => {
                    if unread <= self.padding_tolerance {
                        return Ok(ParseOutcome::EndOfStream);
                    }
                    return Err(Error::DataCorruption(format!(
                        "invalid batch header: {}",
                        err
                    )));
                }
            };

            let body_len = header.body_len();
            let body = self.stream.read_bytes(body_len).await?;
            if body.len() < body_len {
                return Err(Error::DataCorruption(format!(
                    "batch at offset {} truncated: {} of {} body bytes",
                    header.base_offset,
                    body.len(),
                    body_len
                )));
            }

            let batch = Batch::decode_body(header, &body)
                .map_err(|err| Error::DataCorruption(err.to_string()))?;
            self.bytes_consumed += (HEADER_SIZE + body_len) as u64;

            match consumer.accept(batch) {
                ConsumeAck::Continue | ConsumeAck::Skip => continue,
                ConsumeAck::Stop => return Ok(ParseOutcome::Stopped),
            }
        }
    }
}
