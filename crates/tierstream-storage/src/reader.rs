//! Remote Segment Batch Reader
//!
//! Drives the batch parser over a hydrated segment for one reader
//! configuration: position into the file via the sparse index, filter and
//! translate batches, and buffer output until a byte or batch budget is
//! reached.
//!
//! ## Offset translation
//!
//! A configuration addresses either raw offsets or kafka offsets. In the
//! kafka case the reader tracks a running delta, incremented by the record
//! count of every non-data batch it walks past, and rewrites each emitted
//! batch's offsets by the delta in effect *before* that batch. Only
//! the initial delta comes from the manifest snapshot taken at parser
//! construction; everything after is accounted locally, so a concurrent
//! manifest refresh cannot skew a read in progress.
//!
//! ## Delivery guarantees
//!
//! Batches come out in strictly increasing base offset order, each batch at
//! most once across successive `read_some` calls. After a fatal error the
//! reader drains what was wholly parsed, surfaces the error once, and then
//! returns empty.

use std::collections::VecDeque;
use std::sync::Arc;

use tierstream_core::batch::Batch;

use crate::error::{Error, Result};
use crate::manifest::{raw_to_kafka, DeltaOffset, RawOffset};
use crate::parser::{BatchConsumer, BatchParser, ConsumeAck, ParseOutcome};
use crate::retry::RetryNode;
use crate::segment::RemoteSegment;

/// What one reader wants out of a segment.
#[derive(Debug, Clone)]
pub struct ReadConfig {
    /// First offset of interest (inclusive)
    pub start_offset: i64,

    /// Last offset of interest (inclusive)
    pub max_offset: i64,

    /// Byte budget per `read_some` call; one batch of slack is allowed
    pub max_bytes: usize,

    /// Batch budget per `read_some` call
    pub max_batches: usize,

    /// Whether `start_offset`/`max_offset` are kafka offsets; emitted
    /// batches are translated into that space
    pub kafka_offsets: bool,
}

impl ReadConfig {
    /// Read a raw-offset range with default budgets.
    pub fn raw_range(start_offset: RawOffset, max_offset: RawOffset) -> Self {
        Self {
            start_offset,
            max_offset,
            max_bytes: 1024 * 1024,
            max_batches: 256,
            kafka_offsets: false,
        }
    }

    /// Read a kafka-offset range with default budgets.
    pub fn kafka_range(start_offset: i64, max_offset: i64) -> Self {
        Self {
            kafka_offsets: true,
            ..Self::raw_range(start_offset, max_offset)
        }
    }
}

/// Streams bounded slices of record batches out of one remote segment.
pub struct RemoteSegmentReader {
    segment: Arc<RemoteSegment>,
    config: ReadConfig,
    padding_tolerance: u64,
    parser: Option<BatchParser>,
    ring: VecDeque<Batch>,
    total_size: usize,
    initial_delta: DeltaOffset,
    current_delta: DeltaOffset,
    done: bool,
    failed: bool,
    pending_error: Option<Error>,
}

impl RemoteSegmentReader {
    pub fn new(segment: Arc<RemoteSegment>, config: ReadConfig, padding_tolerance: u64) -> Self {
        Self {
            segment,
            config,
            padding_tolerance,
            parser: None,
            ring: VecDeque::new(),
            total_size: 0,
            initial_delta: 0,
            current_delta: 0,
            done: false,
            failed: false,
            pending_error: None,
        }
    }

    /// Raw base offset of the underlying segment.
    pub fn base_offset(&self) -> RawOffset {
        self.segment.base_offset()
    }

    /// Raw committed offset of the underlying segment.
    pub fn max_offset(&self) -> RawOffset {
        self.segment.committed_offset()
    }

    /// Delta snapshot taken when the parser was constructed.
    pub fn initial_delta(&self) -> DeltaOffset {
        self.initial_delta
    }

    /// Whether the reader has exhausted its range or stream.
    pub fn is_done(&self) -> bool {
        self.done && self.ring.is_empty()
    }

    /// Pull the next bounded slice of batches.
    ///
    /// The first call hydrates the segment and positions the parser; later
    /// calls continue from where the previous one stopped. Returns an empty
    /// vector once the range or stream is exhausted, and after the first
    /// fatal error has been surfaced.
    pub async fn read_some(&mut self, rtc: &RetryNode) -> Result<Vec<Batch>> {
        if let Some(err) = self.pending_error.take() {
            self.failed = true;
            return Err(err);
        }
        if self.failed || (self.done && self.ring.is_empty()) {
            return Ok(Vec::new());
        }

        if self.parser.is_none() {
            self.init_parser().await?;
        }

        self.total_size = 0;
        let mut past_range = false;

        let outcome = {
            let parser = self.parser.as_mut().expect("parser initialized above");
            let mut consumer = ReadConsumer {
                config: &self.config,
                rtc,
                ring: &mut self.ring,
                total_size: &mut self.total_size,
                current_delta: &mut self.current_delta,
                past_range: &mut past_range,
            };
            parser.consume(&mut consumer).await
        };

        match outcome {
            Ok(ParseOutcome::EndOfStream) => {
                self.done = true;
            }
            Ok(ParseOutcome::Stopped) => {
                if past_range {
                    self.done = true;
                }
                // an envelope stop with nothing buffered is a plain expiry
                if self.ring.is_empty() && !self.done {
                    rtc.check()?;
                }
            }
            Err(err) => {
                // the parser is no longer aligned; whatever was wholly
                // parsed before the failure still goes out first
                self.parser = None;
                if self.ring.is_empty() {
                    self.failed = true;
                    return Err(err);
                }
                self.pending_error = Some(err);
            }
        }

        Ok(self.ring.drain(..).collect())
    }

    /// Release the parser and its stream; the reader is exhausted after.
    pub fn stop(&mut self) {
        self.parser = None;
        self.ring.clear();
        self.done = true;
        tracing::debug!(
            base_offset = self.segment.base_offset(),
            "Remote segment reader stopped"
        );
    }

    async fn init_parser(&mut self) -> Result<()> {
        self.segment.hydrate().await?;

        // A raw-offset read can seek via the sparse index. A kafka-offset
        // read must parse from the segment start: the delta accounting
        // depends on walking every non-data batch, and the index cannot
        // say how many of those a seek would skip.
        let start_raw = self.config.start_offset.max(self.segment.base_offset());
        let pos = if self.config.kafka_offsets {
            0
        } else {
            self.segment.meta().seek_position(start_raw)
        };

        let stream = self.segment.data_stream(pos).await?;
        self.initial_delta = self.segment.delta_offset();
        self.current_delta = self.initial_delta;
        self.parser = Some(BatchParser::new(stream, self.padding_tolerance));

        tracing::debug!(
            base_offset = self.segment.base_offset(),
            start_raw,
            file_pos = pos,
            initial_delta = self.initial_delta,
            "Reader positioned into segment"
        );
        Ok(())
    }
}

/// Parser consumer for one `read_some` call: delta accounting, range
/// filtering, translation and budget enforcement.
struct ReadConsumer<'a> {
    config: &'a ReadConfig,
    rtc: &'a RetryNode,
    ring: &'a mut VecDeque<Batch>,
    total_size: &'a mut usize,
    current_delta: &'a mut DeltaOffset,
    past_range: &'a mut bool,
}

impl BatchConsumer for ReadConsumer<'_> {
    fn accept(&mut self, mut batch: Batch) -> ConsumeAck {
        let envelope_expired = self.rtc.check().is_err();
        let batch_delta = *self.current_delta;

        if !batch.header.batch_type.is_data() {
            // non-data batches occupy raw offsets without producing
            // consumer offsets
            *self.current_delta += batch.header.record_count as i64;
            return if envelope_expired {
                ConsumeAck::Stop
            } else {
                ConsumeAck::Skip
            };
        }

        let (base, last) = if self.config.kafka_offsets {
            (
                raw_to_kafka(batch.base_offset(), batch_delta),
                raw_to_kafka(batch.last_offset(), batch_delta),
            )
        } else {
            (batch.base_offset(), batch.last_offset())
        };

        if last < self.config.start_offset {
            return if envelope_expired {
                ConsumeAck::Stop
            } else {
                ConsumeAck::Skip
            };
        }
        if base > self.config.max_offset {
            *self.past_range = true;
            return ConsumeAck::Stop;
        }

        if self.config.kafka_offsets {
            batch.header.base_offset -= batch_delta;
            for record in &mut batch.records {
                record.offset -= batch_delta;
            }
        }

        *self.total_size += batch.size_bytes();
        self.ring.push_back(batch);

        if envelope_expired
            || *self.total_size >= self.config.max_bytes
            || self.ring.len() >= self.config.max_batches
        {
            ConsumeAck::Stop
        } else {
            ConsumeAck::Continue
        }
    }
}
