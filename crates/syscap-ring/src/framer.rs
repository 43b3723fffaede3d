//! Event Framer
//!
//! Walks the records of a checked-out span one at a time. Lost-count records
//! are accounted and skipped; a data sample stops the walk and its event is
//! returned as a borrow of ring memory. The delivered sample stays under the
//! cursor until the next `advance(.., true)` steps past it. A sample whose
//! record is sound but whose event is malformed is stepped over as it is
//! reported; broken record envelopes leave the cursor on the bad record.

use crate::buffer::{Piece, RingSpan};
use crate::error::{CaptureError, CaptureResult, FramingFault};
use crate::record::{
    RecordHeader, RecordKind, LOST_RECORD_LEN, RECORD_HEADER_LEN, SAMPLE_PREFIX_LEN,
};
use std::sync::Arc;
use syscap_core::{BufferId, BufferMetrics, EventView};
use tracing::{debug, warn};

/// An event located inside a sample record
#[derive(Debug, Clone, Copy)]
pub struct FramedEvent<'a> {
    pub event: EventView<'a>,
    /// Ring counter of the enclosing record
    pub offset: u64,
    /// Declared size of the enclosing record
    pub record_size: u16,
}

/// Record walker over one checkout
pub struct EventFramer {
    buffer: BufferId,
    /// Offset of the next unprocessed record within the span
    cursor: u64,
    /// Bytes left in the span from the cursor
    remaining: u64,
    /// Holds samples that straddle the physical end of the ring
    scratch: Vec<u8>,
    metrics: Arc<BufferMetrics>,
}

impl EventFramer {
    pub fn new(buffer: BufferId, metrics: Arc<BufferMetrics>) -> Self {
        Self {
            buffer,
            cursor: 0,
            remaining: 0,
            scratch: Vec::new(),
            metrics,
        }
    }

    /// Start walking a fresh span of `len` bytes
    pub fn reset(&mut self, len: u64) {
        self.cursor = 0;
        self.remaining = len;
    }

    /// Bytes of fully processed records
    pub fn consumed(&self) -> u64 {
        self.cursor
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn step(&mut self, size: u16) {
        self.cursor += size as u64;
        self.remaining -= size as u64;
    }

    fn fault(&self, span: &RingSpan<'_>, fault: FramingFault) -> CaptureError {
        BufferMetrics::incr(&self.metrics.framing_errors);
        let offset = span.start() + self.cursor;
        warn!(
            buffer = self.buffer,
            offset,
            remaining = self.remaining,
            "framing error: {}",
            fault
        );
        CaptureError::Framing {
            buffer: self.buffer,
            offset,
            remaining: self.remaining,
            fault,
        }
    }

    /// Frame the next deliverable event
    ///
    /// `span` must be the span passed to the last `reset`. With
    /// `skip_current` the first data sample reached is stepped over instead
    /// of delivered. Returns `None` once the span is exhausted.
    pub fn advance<'s>(
        &'s mut self,
        span: RingSpan<'s>,
        mut skip_current: bool,
    ) -> CaptureResult<Option<FramedEvent<'s>>> {
        loop {
            if self.remaining == 0 {
                return Ok(None);
            }
            let cursor = self.cursor as usize;

            let raw = match span.read_array::<RECORD_HEADER_LEN>(cursor) {
                Some(raw) if self.remaining >= RECORD_HEADER_LEN as u64 => raw,
                _ => {
                    let remaining = self.remaining;
                    return Err(self.fault(&span, FramingFault::ShortHeader { remaining }));
                }
            };
            let header = RecordHeader::parse(raw);

            if header.size == 0 {
                return Err(self.fault(&span, FramingFault::ZeroSize));
            }
            if header.size as u64 > self.remaining {
                let remaining = self.remaining;
                return Err(self.fault(
                    &span,
                    FramingFault::Truncated {
                        declared: header.size,
                        remaining,
                    },
                ));
            }
            if (header.size as usize) < RECORD_HEADER_LEN {
                return Err(self.fault(
                    &span,
                    FramingFault::Undersized {
                        kind: "record",
                        size: header.size,
                    },
                ));
            }

            match header.kind() {
                RecordKind::Lost => {
                    if (header.size as usize) < LOST_RECORD_LEN {
                        return Err(self.fault(
                            &span,
                            FramingFault::Undersized {
                                kind: "lost",
                                size: header.size,
                            },
                        ));
                    }
                    let lost = span.read_u64(cursor + 16).unwrap_or(0);
                    debug!(buffer = self.buffer, lost, "producer reported lost events");
                    BufferMetrics::add(&self.metrics.lost_events, lost);
                    BufferMetrics::incr(&self.metrics.lost_records);
                    self.step(header.size);
                }
                RecordKind::Sample => {
                    if (header.size as usize) < SAMPLE_PREFIX_LEN {
                        return Err(self.fault(
                            &span,
                            FramingFault::Undersized {
                                kind: "sample",
                                size: header.size,
                            },
                        ));
                    }
                    if skip_current {
                        skip_current = false;
                        self.step(header.size);
                        continue;
                    }

                    let raw_size = span.read_u32(cursor + RECORD_HEADER_LEN).unwrap_or(0);
                    if SAMPLE_PREFIX_LEN as u64 + raw_size as u64 > header.size as u64 {
                        return Err(self.fault(
                            &span,
                            FramingFault::SampleOverrun {
                                raw_size,
                                size: header.size,
                            },
                        ));
                    }

                    let offset = span.start() + self.cursor;
                    let payload = match span.piece(cursor + SAMPLE_PREFIX_LEN, raw_size as usize) {
                        Some(Piece::Contiguous(bytes)) => bytes,
                        Some(Piece::Split(head, tail)) => {
                            self.scratch.clear();
                            self.scratch.extend_from_slice(head);
                            self.scratch.extend_from_slice(tail);
                            &self.scratch[..]
                        }
                        // Bounded by header.size <= remaining above
                        None => &[],
                    };

                    return match EventView::parse(payload) {
                        Ok(event) => Ok(Some(FramedEvent {
                            event,
                            offset,
                            record_size: header.size,
                        })),
                        Err(err) => {
                            BufferMetrics::incr(&self.metrics.framing_errors);
                            warn!(buffer = self.buffer, offset, "malformed event: {}", err);
                            let remaining = self.remaining;
                            // Envelope already checked against remaining
                            self.cursor += header.size as u64;
                            self.remaining -= header.size as u64;
                            Err(CaptureError::Framing {
                                buffer: self.buffer,
                                offset,
                                remaining,
                                fault: FramingFault::MalformedEvent(err),
                            })
                        }
                    };
                }
                RecordKind::Unknown(kind) => {
                    BufferMetrics::incr(&self.metrics.unknown_records);
                    let offset = span.start() + self.cursor;
                    warn!(buffer = self.buffer, offset, kind, "unknown record kind");
                    return Err(CaptureError::UnknownRecord {
                        buffer: self.buffer,
                        offset,
                        kind,
                        size: header.size,
                    });
                }
            }
        }
    }
}
