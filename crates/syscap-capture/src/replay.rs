//! Stored event streams
//!
//! A stored stream is delivered events written back to back; each event is
//! self-delimiting through its header length. `ReplaySource` reads one back
//! through the same conversion step as the live path, so events from old
//! producers upgrade identically whether they come from a ring or a file.

use crate::stream::{normalize_event, Event};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use syscap_convert::{Converter, Scratch};
use syscap_core::events::EVENT_HEADER_LEN;
use syscap_core::{BufferId, BufferMetrics, EventError, EventHeader, EventView};
use syscap_ring::{CaptureError, CaptureResult, FramingFault};
use tracing::{debug, info, warn};

/// Largest event a stored stream may carry
const MAX_STORED_EVENT_LEN: usize = 16 * 1024 * 1024;

/// Writes delivered events to a stored stream
pub struct EventRecorder<W: Write> {
    out: W,
    events: u64,
    bytes: u64,
}

impl EventRecorder<BufWriter<File>> {
    /// Record into a new file at `path`
    pub fn create(path: &Path) -> io::Result<Self> {
        info!("Recording events to {:?}", path);
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> EventRecorder<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            events: 0,
            bytes: 0,
        }
    }

    /// Append one event
    pub fn record(&mut self, event: &EventView<'_>) -> io::Result<()> {
        self.out.write_all(event.as_bytes())?;
        self.events += 1;
        self.bytes += event.len() as u64;
        Ok(())
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Flush and hand back the writer
    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        debug!("Recorded {} events ({} bytes)", self.events, self.bytes);
        Ok(self.out)
    }
}

/// Reads a stored stream back as events
pub struct ReplaySource<R: Read> {
    input: R,
    id: BufferId,
    buf: Vec<u8>,
    converter: Converter,
    convert_enabled: bool,
    scratch: Scratch,
    remainder: Vec<u8>,
    /// Byte position of the next event
    position: u64,
    /// A malformed event ends the stream; the rest cannot be delimited
    finished: bool,
    metrics: Arc<BufferMetrics>,
}

impl ReplaySource<BufReader<File>> {
    /// Replay the stored stream at `path`
    pub fn open(path: &Path, converter: Converter, metrics: Arc<BufferMetrics>) -> CaptureResult<Self> {
        let file = File::open(path)?;
        info!("Replaying events from {:?}", path);
        Ok(Self::new(BufReader::new(file), converter, metrics))
    }
}

impl<R: Read> ReplaySource<R> {
    pub fn new(input: R, converter: Converter, metrics: Arc<BufferMetrics>) -> Self {
        Self {
            input,
            id: 0,
            buf: Vec::new(),
            converter,
            convert_enabled: true,
            scratch: Scratch::new(),
            remainder: Vec::new(),
            position: 0,
            finished: false,
            metrics,
        }
    }

    /// Id reported in events and errors
    pub fn with_id(mut self, id: BufferId) -> Self {
        self.id = id;
        self
    }

    pub fn with_conversion(mut self, enabled: bool) -> Self {
        self.convert_enabled = enabled;
        self
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    fn malformed(&mut self, fault: FramingFault) -> CaptureError {
        self.finished = true;
        stream_fault(&self.metrics, self.id, self.position, self.buf.len() as u64, fault)
    }

    /// Read the next event
    ///
    /// `Ok(None)` at a clean end of stream. A truncated or malformed event
    /// is reported once and ends the stream.
    pub fn next_event(&mut self) -> CaptureResult<Option<Event<'_>>> {
        if let Some((_, bytes)) = self.converter.take_split_remainder() {
            self.remainder = bytes;
            let view = EventView::parse(&self.remainder).map_err(|e| CaptureError::Conversion {
                buffer: self.id,
                tid: 0,
                event_type: "unknown",
                message: format!("split remainder is malformed: {}", e),
            })?;
            return normalize_event(
                &mut self.converter,
                self.convert_enabled,
                &mut self.scratch,
                &self.metrics,
                self.id,
                view,
            )
            .map(Some);
        }

        if self.finished {
            return Ok(None);
        }

        self.buf.resize(EVENT_HEADER_LEN, 0);
        let got = read_full(&mut self.input, &mut self.buf)?;
        if got == 0 {
            self.finished = true;
            return Ok(None);
        }
        if got < EVENT_HEADER_LEN {
            self.buf.truncate(got);
            return Err(self.malformed(FramingFault::MalformedEvent(EventError::TooShort {
                needed: EVENT_HEADER_LEN,
                available: got,
            })));
        }

        let header = match EventHeader::parse(&self.buf) {
            Ok(header) => header,
            Err(e) => return Err(self.malformed(FramingFault::MalformedEvent(e))),
        };
        let len = header.len as usize;
        if !(EVENT_HEADER_LEN..=MAX_STORED_EVENT_LEN).contains(&len) {
            return Err(self.malformed(FramingFault::MalformedEvent(EventError::LengthOverrun {
                declared: len,
                available: MAX_STORED_EVENT_LEN,
            })));
        }

        self.buf.resize(len, 0);
        let body = read_full(&mut self.input, &mut self.buf[EVENT_HEADER_LEN..])?;
        if body < len - EVENT_HEADER_LEN {
            self.buf.truncate(EVENT_HEADER_LEN + body);
            return Err(self.malformed(FramingFault::MalformedEvent(EventError::LengthOverrun {
                declared: len,
                available: EVENT_HEADER_LEN + body,
            })));
        }

        let view = match EventView::parse(&self.buf) {
            Ok(view) => view,
            Err(e) => {
                self.finished = true;
                return Err(stream_fault(
                    &self.metrics,
                    self.id,
                    self.position,
                    len as u64,
                    FramingFault::MalformedEvent(e),
                ));
            }
        };
        self.position += len as u64;

        normalize_event(
            &mut self.converter,
            self.convert_enabled,
            &mut self.scratch,
            &self.metrics,
            self.id,
            view,
        )
        .map(Some)
    }
}

fn stream_fault(
    metrics: &BufferMetrics,
    buffer: BufferId,
    offset: u64,
    remaining: u64,
    fault: FramingFault,
) -> CaptureError {
    BufferMetrics::incr(&metrics.framing_errors);
    warn!(buffer, offset, "stored stream is malformed: {}", fault);
    CaptureError::Framing {
        buffer,
        offset,
        remaining,
        fault,
    }
}

/// Fill `buf` as far as the input allows, returning the bytes read
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use syscap_convert::RuleTable;
    use syscap_core::{EventBuilder, EventType};

    fn source(bytes: Vec<u8>) -> ReplaySource<Cursor<Vec<u8>>> {
        ReplaySource::new(
            Cursor::new(bytes),
            Converter::new(Arc::new(RuleTable::legacy())),
            Arc::new(BufferMetrics::new()),
        )
    }

    #[test]
    fn test_recorder_writes_back_to_back() {
        let a = EventBuilder::new(EventType::CloseE.code()).param_i64(1).build();
        let b = EventBuilder::new(EventType::CloseX.code()).param_i64(0).build();
        let mut recorder = EventRecorder::new(Vec::new());
        recorder.record(&EventView::parse(&a).unwrap()).unwrap();
        recorder.record(&EventView::parse(&b).unwrap()).unwrap();
        assert_eq!(recorder.events(), 2);
        let out = recorder.finish().unwrap();
        assert_eq!(out, [a, b].concat());
    }

    #[test]
    fn test_replay_reads_events_in_order() {
        let events: Vec<Vec<u8>> = (0..3)
            .map(|tid| {
                EventBuilder::new(EventType::CloseX.code())
                    .tid(tid)
                    .param_i64(0)
                    .build()
            })
            .collect();
        let mut replay = source(events.concat());
        for want in &events {
            let event = replay.next_event().unwrap().unwrap();
            assert_eq!(event.as_bytes(), &want[..]);
        }
        assert!(replay.next_event().unwrap().is_none());
        assert_eq!(replay.position(), events.concat().len() as u64);
    }

    #[test]
    fn test_truncated_tail_is_reported_once() {
        let event = EventBuilder::new(EventType::CloseX.code()).param_i64(0).build();
        let mut bytes = event.clone();
        bytes.extend_from_slice(&event[..event.len() - 3]);

        let mut replay = source(bytes);
        assert!(replay.next_event().unwrap().is_some());
        let err = replay.next_event().unwrap_err();
        assert!(err.is_framing());
        assert!(replay.next_event().unwrap().is_none());
    }

    #[test]
    fn test_short_header_is_reported() {
        let mut replay = source(vec![0u8; 10]);
        assert!(replay.next_event().unwrap_err().is_framing());
    }

    #[test]
    fn test_legacy_events_are_converted() {
        let legacy = EventBuilder::new(EventType::MmapX.code())
            .tid(2)
            .param_i32(-4)
            .build();
        let mut replay = source(legacy);
        let event = replay.next_event().unwrap().unwrap();
        assert!(event.was_converted());
        assert_eq!(event.param_i64(0), Some(-4));
    }
}
