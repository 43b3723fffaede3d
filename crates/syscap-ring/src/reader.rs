//! Ring Reader
//!
//! Checks out the whole readable window of a buffer and hands the bytes back
//! to the producer on commit. At most one checkout is outstanding at a time.

use crate::buffer::{RingSpan, SharedBuffer};
use crate::error::{CaptureError, CaptureResult};
use std::sync::Arc;
use syscap_core::{BufferId, BufferMetrics};
use tracing::trace;

/// Reader side of one shared buffer
pub struct RingReader {
    buffer: SharedBuffer,
    /// Tail counter at the time of the outstanding checkout
    checkout_tail: u64,
    /// Bytes checked out and not yet committed
    last_read_size: u64,
    metrics: Arc<BufferMetrics>,
}

impl RingReader {
    pub fn new(buffer: SharedBuffer, metrics: Arc<BufferMetrics>) -> Self {
        Self {
            buffer,
            checkout_tail: 0,
            last_read_size: 0,
            metrics,
        }
    }

    pub fn id(&self) -> BufferId {
        self.buffer.id()
    }

    pub fn buffer(&self) -> &SharedBuffer {
        &self.buffer
    }

    pub fn metrics(&self) -> &Arc<BufferMetrics> {
        &self.metrics
    }

    /// Bytes currently checked out
    pub fn last_read_size(&self) -> u64 {
        self.last_read_size
    }

    /// Check out everything the producer has published
    ///
    /// Never blocks; an empty ring yields an empty span and leaves nothing
    /// checked out. Fails while a previous checkout is still outstanding.
    pub fn read(&mut self) -> CaptureResult<RingSpan<'_>> {
        if self.last_read_size != 0 {
            return Err(CaptureError::CheckoutOutstanding {
                buffer: self.buffer.id(),
                outstanding: self.last_read_size,
            });
        }

        let ptrs = self.buffer.pointers();
        if ptrs.read_size == 0 {
            return Ok(RingSpan::empty(ptrs.tail));
        }

        trace!(
            buffer = self.buffer.id(),
            head = ptrs.head,
            tail = ptrs.tail,
            read_size = ptrs.read_size,
            "checked out"
        );
        BufferMetrics::incr(&self.metrics.reads);
        self.checkout_tail = ptrs.tail;
        self.last_read_size = ptrs.read_size;
        Ok(self.buffer.span(ptrs.tail, ptrs.read_size))
    }

    /// The outstanding checkout, if any
    pub fn checkout(&self) -> Option<RingSpan<'_>> {
        if self.last_read_size == 0 {
            return None;
        }
        Some(self.buffer.span(self.checkout_tail, self.last_read_size))
    }

    /// Advance the tail past the whole checkout
    pub fn commit(&mut self) -> CaptureResult<u64> {
        if self.last_read_size == 0 {
            return Err(CaptureError::NothingCheckedOut {
                buffer: self.buffer.id(),
            });
        }
        Ok(self.release(self.last_read_size))
    }

    /// Advance the tail past the first `consumed` bytes of the checkout and
    /// drop the rest of it
    ///
    /// The dropped bytes stay published and are read again on the next
    /// `read`. Returns the number of bytes released.
    pub fn release(&mut self, consumed: u64) -> u64 {
        let consumed = consumed.min(self.last_read_size);
        if consumed > 0 {
            self.buffer.store_tail(self.checkout_tail + consumed);
            BufferMetrics::add(&self.metrics.bytes_committed, consumed);
        }
        self.last_read_size = 0;
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::encode_lost;

    fn reader(size: usize) -> (RingReader, crate::producer::RingProducer) {
        let (buffer, producer) = SharedBuffer::with_producer(0, size).unwrap();
        (RingReader::new(buffer, Arc::new(BufferMetrics::new())), producer)
    }

    #[test]
    fn test_empty_read_checks_out_nothing() {
        let (mut reader, _producer) = reader(4096);
        assert!(reader.read().unwrap().is_empty());
        assert_eq!(reader.last_read_size(), 0);
        assert!(reader.checkout().is_none());
        assert!(matches!(
            reader.commit(),
            Err(CaptureError::NothingCheckedOut { buffer: 0 })
        ));
    }

    #[test]
    fn test_single_outstanding_checkout() {
        let (mut reader, mut producer) = reader(4096);
        assert!(producer.write_raw(&encode_lost(0, 1)));

        assert_eq!(reader.read().unwrap().len(), 24);
        assert_eq!(reader.last_read_size(), 24);
        assert!(matches!(
            reader.read(),
            Err(CaptureError::CheckoutOutstanding { outstanding: 24, .. })
        ));

        assert_eq!(reader.commit().unwrap(), 24);
        assert_eq!(reader.last_read_size(), 0);
        assert_eq!(reader.buffer().pointers().tail, 24);
        assert_eq!(reader.metrics().snapshot().bytes_committed, 24);
    }

    #[test]
    fn test_partial_release_rereads_rest() {
        let (mut reader, mut producer) = reader(4096);
        assert!(producer.write_raw(&encode_lost(0, 1)));
        assert!(producer.write_raw(&encode_lost(0, 2)));

        assert_eq!(reader.read().unwrap().len(), 48);
        assert_eq!(reader.release(24), 24);
        assert!(reader.checkout().is_none());

        let span = reader.read().unwrap();
        assert_eq!(span.start(), 24);
        assert_eq!(span.len(), 24);
    }

    #[test]
    fn test_read_sees_later_writes_after_commit() {
        let (mut reader, mut producer) = reader(4096);
        assert!(producer.write_raw(&encode_lost(0, 1)));
        reader.read().unwrap();
        assert!(producer.write_raw(&encode_lost(0, 2)));
        // The checkout still covers only the first record
        assert_eq!(reader.checkout().unwrap().len(), 24);
        reader.commit().unwrap();
        assert_eq!(reader.read().unwrap().len(), 24);
        assert_eq!(reader.metrics().snapshot().reads, 2);
    }
}
