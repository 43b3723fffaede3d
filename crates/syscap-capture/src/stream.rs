//! Pipeline Facade
//!
//! `EventStream` composes reader, framer and converter into a pull API.
//! Each pull first positions the stream on a deliverable event (`prepare`),
//! then borrows it out (`deliver`). The returned `Event` borrows the stream,
//! so it cannot outlive the next pull or an explicit commit.

use std::ops::Deref;
use std::sync::Arc;
use syscap_convert::{Converter, Normalized, Scratch};
use syscap_core::events::catalog;
use syscap_core::{BufferId, BufferMetrics, BufferStats, EventView};
use syscap_ring::{CaptureError, CaptureResult, EventFramer, RingReader, SharedBuffer};
use tracing::{debug, warn};

/// A delivered, current-layout event
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    view: EventView<'a>,
    buffer: BufferId,
    passes: u32,
}

impl<'a> Event<'a> {
    pub fn view(&self) -> &EventView<'a> {
        &self.view
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.view.as_bytes()
    }

    /// Buffer the event was read from
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Conversion passes applied, 0 for events delivered as written
    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn was_converted(&self) -> bool {
        self.passes > 0
    }
}

impl<'a> Deref for Event<'a> {
    type Target = EventView<'a>;

    fn deref(&self) -> &Self::Target {
        &self.view
    }
}

/// Run `view` through the converter and account for the outcome
///
/// Shared by the live and the replay path so both upgrade events the same way.
pub(crate) fn normalize_event<'a>(
    converter: &mut Converter,
    enabled: bool,
    scratch: &'a mut Scratch,
    metrics: &BufferMetrics,
    buffer: BufferId,
    view: EventView<'a>,
) -> CaptureResult<Event<'a>> {
    if !enabled {
        BufferMetrics::incr(&metrics.delivered_events);
        return Ok(Event {
            view,
            buffer,
            passes: 0,
        });
    }

    let tid = view.tid();
    let event_type = catalog::type_name(view.event_type());
    match converter.normalize(view, scratch) {
        Normalized::Unchanged(view) => {
            BufferMetrics::incr(&metrics.delivered_events);
            Ok(Event {
                view,
                buffer,
                passes: 0,
            })
        }
        Normalized::Converted { event, passes } => {
            debug!(buffer, tid, event_type, passes, "converted legacy event");
            BufferMetrics::incr(&metrics.converted_events);
            BufferMetrics::incr(&metrics.delivered_events);
            Ok(Event {
                view: event,
                buffer,
                passes,
            })
        }
        Normalized::Failed { message, passes } => {
            warn!(buffer, tid, event_type, passes, "dropping event: {}", message);
            BufferMetrics::incr(&metrics.conversion_failures);
            Err(CaptureError::Conversion {
                buffer,
                tid,
                event_type,
                message,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Nothing,
    /// A split remainder sits in `remainder`
    Remainder,
    /// A sample sits under the framer cursor
    Record,
}

/// Event stream over one shared buffer
pub struct EventStream {
    reader: RingReader,
    framer: EventFramer,
    converter: Converter,
    convert_enabled: bool,
    scratch: Scratch,
    remainder: Vec<u8>,
    pending: Pending,
    /// The record under the cursor was delivered; step past it next time
    skip_current: bool,
    /// Size of the record under the cursor
    current_record: u64,
    metrics: Arc<BufferMetrics>,
}

impl EventStream {
    pub fn new(buffer: SharedBuffer, converter: Converter, metrics: Arc<BufferMetrics>) -> Self {
        let id = buffer.id();
        Self {
            reader: RingReader::new(buffer, metrics.clone()),
            framer: EventFramer::new(id, metrics.clone()),
            converter,
            convert_enabled: true,
            scratch: Scratch::new(),
            remainder: Vec::new(),
            pending: Pending::Nothing,
            skip_current: false,
            current_record: 0,
            metrics,
        }
    }

    /// Deliver events exactly as written, without conversion
    pub fn with_conversion(mut self, enabled: bool) -> Self {
        self.convert_enabled = enabled;
        self
    }

    pub fn id(&self) -> BufferId {
        self.reader.id()
    }

    pub fn stats(&self) -> BufferStats {
        self.metrics.snapshot()
    }

    pub fn metrics(&self) -> &Arc<BufferMetrics> {
        &self.metrics
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    pub fn converter_mut(&mut self) -> &mut Converter {
        &mut self.converter
    }

    /// Bytes currently checked out from the ring
    pub fn checked_out(&self) -> u64 {
        self.reader.last_read_size()
    }

    /// Pull the next event
    ///
    /// `Ok(None)` means no data right now. Framing errors abort this pull;
    /// the bytes before the bad record are released and the next pull
    /// starts again from the new tail. A malformed event in a sound record
    /// is released along with that prefix, so it is reported only once.
    /// Conversion errors drop only the offending event.
    pub fn next_event(&mut self) -> CaptureResult<Option<Event<'_>>> {
        if !self.prepare()? {
            return Ok(None);
        }
        self.deliver()
    }

    /// Position the stream on the next deliverable event
    ///
    /// Commits a fully walked checkout and reads the ring again once.
    /// Returns whether an event is ready.
    pub(crate) fn prepare(&mut self) -> CaptureResult<bool> {
        if self.pending != Pending::Nothing {
            return Ok(true);
        }

        if let Some((tid, bytes)) = self.converter.take_split_remainder() {
            debug!(buffer = self.id(), tid, "delivering split remainder");
            self.remainder = bytes;
            self.pending = Pending::Remainder;
            return Ok(true);
        }

        let mut refreshed = false;
        loop {
            if self.reader.checkout().is_none() {
                let len = self.reader.read()?.len() as u64;
                if len == 0 {
                    return Ok(false);
                }
                self.framer.reset(len);
                self.skip_current = false;
                self.current_record = 0;
            }

            let skip = self.skip_current;
            let step = match self.reader.checkout() {
                Some(span) => match self.framer.advance(span, skip) {
                    Ok(found) => Ok(found.map(|framed| framed.record_size)),
                    Err(e) => Err(e),
                },
                None => Ok(None),
            };

            match step {
                Ok(Some(record_size)) => {
                    self.skip_current = false;
                    self.current_record = record_size as u64;
                    self.pending = Pending::Record;
                    return Ok(true);
                }
                Ok(None) => {
                    if self.reader.last_read_size() > 0 {
                        self.reader.commit()?;
                    }
                    self.skip_current = false;
                    self.current_record = 0;
                    if refreshed {
                        return Ok(false);
                    }
                    refreshed = true;
                }
                Err(e) => {
                    let consumed = self.framer.consumed();
                    self.reader.release(consumed);
                    self.skip_current = false;
                    self.current_record = 0;
                    return Err(e);
                }
            }
        }
    }

    /// Borrow out the event `prepare` positioned on
    pub(crate) fn deliver(&mut self) -> CaptureResult<Option<Event<'_>>> {
        let buffer = self.reader.id();
        match self.pending {
            Pending::Nothing => Ok(None),
            Pending::Remainder => {
                self.pending = Pending::Nothing;
                let view = match EventView::parse(&self.remainder) {
                    Ok(view) => view,
                    Err(e) => {
                        BufferMetrics::incr(&self.metrics.conversion_failures);
                        return Err(CaptureError::Conversion {
                            buffer,
                            tid: 0,
                            event_type: "unknown",
                            message: format!("split remainder is malformed: {}", e),
                        });
                    }
                };
                normalize_event(
                    &mut self.converter,
                    self.convert_enabled,
                    &mut self.scratch,
                    &self.metrics,
                    buffer,
                    view,
                )
                .map(Some)
            }
            Pending::Record => {
                self.pending = Pending::Nothing;
                // Whatever happens below, the next pull moves past this record
                self.skip_current = true;
                let Some(span) = self.reader.checkout() else {
                    return Ok(None);
                };
                let Some(framed) = self.framer.advance(span, false)? else {
                    return Ok(None);
                };
                normalize_event(
                    &mut self.converter,
                    self.convert_enabled,
                    &mut self.scratch,
                    &self.metrics,
                    buffer,
                    framed.event,
                )
                .map(Some)
            }
        }
    }

    /// Release everything delivered so far back to the producer
    ///
    /// Records not yet walked are read again on the next pull. Returns the
    /// number of bytes released.
    pub fn commit(&mut self) -> u64 {
        if self.reader.checkout().is_none() {
            return 0;
        }
        let mut consumed = self.framer.consumed();
        if self.skip_current {
            consumed += self.current_record;
        }
        if self.pending == Pending::Record {
            self.pending = Pending::Nothing;
        }
        self.skip_current = false;
        self.current_record = 0;
        self.reader.release(consumed)
    }

    /// Drop held conversion state, e.g. when a capture session restarts
    pub fn clear_conversion_state(&mut self) {
        self.converter.clear();
        if self.pending == Pending::Remainder {
            self.pending = Pending::Nothing;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syscap_convert::RuleTable;
    use syscap_core::{EventBuilder, EventType};
    use syscap_ring::RingProducer;

    fn stream(size: usize) -> (EventStream, RingProducer) {
        let (buffer, producer) = SharedBuffer::with_producer(0, size).unwrap();
        let converter = Converter::new(Arc::new(RuleTable::legacy()));
        (
            EventStream::new(buffer, converter, Arc::new(BufferMetrics::new())),
            producer,
        )
    }

    fn close_x(tid: u64) -> Vec<u8> {
        EventBuilder::new(EventType::CloseX.code())
            .tid(tid)
            .param_i64(0)
            .build()
    }

    #[test]
    fn test_empty_stream() {
        let (mut stream, _producer) = stream(4096);
        assert!(stream.next_event().unwrap().is_none());
        assert_eq!(stream.checked_out(), 0);
    }

    #[test]
    fn test_drained_checkout_is_committed_on_next_pull() {
        let (mut stream, mut producer) = stream(4096);
        producer.submit(&close_x(1)).unwrap();

        assert_eq!(stream.next_event().unwrap().unwrap().tid(), 1);
        assert!(stream.checked_out() > 0);

        assert!(stream.next_event().unwrap().is_none());
        assert_eq!(stream.checked_out(), 0);
        assert_eq!(producer.free_space(), 4096);
    }

    #[test]
    fn test_new_data_seen_after_drain() {
        let (mut stream, mut producer) = stream(4096);
        producer.submit(&close_x(1)).unwrap();
        assert!(stream.next_event().unwrap().is_some());
        producer.submit(&close_x(2)).unwrap();
        // Drains the first checkout, then picks up the new record in the same pull
        assert_eq!(stream.next_event().unwrap().unwrap().tid(), 2);
    }

    #[test]
    fn test_explicit_commit_releases_delivered_records() {
        let (mut stream, mut producer) = stream(4096);
        producer.submit(&close_x(1)).unwrap();
        producer.submit(&close_x(2)).unwrap();

        assert_eq!(stream.next_event().unwrap().unwrap().tid(), 1);
        let released = stream.commit();
        assert_eq!(released, 48);
        assert_eq!(stream.checked_out(), 0);

        // The unread record is read again
        assert_eq!(stream.next_event().unwrap().unwrap().tid(), 2);
        assert!(stream.next_event().unwrap().is_none());
        assert_eq!(stream.commit(), 0);
    }

    #[test]
    fn test_conversion_failure_skips_event() {
        let (mut stream, mut producer) = stream(4096);
        // mmap exit with a 2-byte result cannot be widened
        let bad = EventBuilder::new(EventType::MmapX.code())
            .tid(5)
            .param_bytes(&[1, 2])
            .build();
        producer.submit(&bad).unwrap();
        producer.submit(&close_x(6)).unwrap();

        let err = stream.next_event().unwrap_err();
        assert!(err.is_conversion());
        assert_eq!(stream.next_event().unwrap().unwrap().tid(), 6);

        let stats = stream.stats();
        assert_eq!(stats.conversion_failures, 1);
        assert_eq!(stats.delivered_events, 1);
    }

    #[test]
    fn test_conversion_disabled_passes_legacy_through() {
        let (buffer, mut producer) = SharedBuffer::with_producer(0, 4096).unwrap();
        let converter = Converter::new(Arc::new(RuleTable::legacy()));
        let mut stream = EventStream::new(buffer, converter, Arc::new(BufferMetrics::new()))
            .with_conversion(false);
        let legacy = EventBuilder::new(EventType::MmapX.code())
            .param_i32(-1)
            .build();
        producer.submit(&legacy).unwrap();

        let event = stream.next_event().unwrap().unwrap();
        assert_eq!(event.as_bytes(), &legacy[..]);
        assert!(!event.was_converted());
    }

    #[test]
    fn test_malformed_event_is_reported_once() {
        let (mut stream, mut producer) = stream(4096);
        let mut bad = syscap_ring::record::encode_sample(&close_x(1)).unwrap();
        // Event length field, past the 12-byte sample prefix
        bad[28..32].copy_from_slice(&4000u32.to_le_bytes());
        assert!(producer.write_raw(&bad));
        producer.submit(&close_x(2)).unwrap();

        let err = stream.next_event().unwrap_err();
        assert!(err.is_framing());
        assert_eq!(producer.free_space(), 4096 - 48);

        assert_eq!(stream.next_event().unwrap().unwrap().tid(), 2);
        assert!(stream.next_event().unwrap().is_none());
        assert_eq!(producer.free_space(), 4096);

        let stats = stream.stats();
        assert_eq!(stats.framing_errors, 1);
        assert_eq!(stats.delivered_events, 1);
    }

    #[test]
    fn test_framing_error_releases_good_prefix() {
        let (mut stream, mut producer) = stream(4096);
        producer.submit(&close_x(1)).unwrap();
        // Unknown record kind 77
        let mut bogus = syscap_ring::RecordHeader {
            kind: 77,
            misc: 0,
            size: 16,
        }
        .encode()
        .to_vec();
        bogus.extend_from_slice(&[0u8; 8]);
        assert!(producer.write_raw(&bogus));

        assert_eq!(stream.next_event().unwrap().unwrap().tid(), 1);
        let err = stream.next_event().unwrap_err();
        assert!(matches!(err, CaptureError::UnknownRecord { kind: 77, .. }));
        // The delivered record was handed back, the bad one was not
        assert_eq!(stream.checked_out(), 0);
        assert_eq!(producer.free_space(), 4096 - 16);
        assert_eq!(stream.stats().unknown_records, 1);
    }
}
