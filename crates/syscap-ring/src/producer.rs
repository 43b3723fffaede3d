//! In-process producer
//!
//! Writes records into a heap-backed ring following the same publication
//! protocol a kernel producer does: payload first, then head with release
//! ordering. Used by the synthetic event generator, the demo and tests.

use crate::buffer::Region;
use crate::error::CaptureResult;
use crate::record::{encode_lost, encode_sample, LOST_RECORD_LEN};
use std::sync::Arc;
use syscap_core::BufferId;

/// Producer side of one heap-backed buffer
pub struct RingProducer {
    id: BufferId,
    region: Arc<Region>,
    /// Events dropped since the last lost-count record made it out
    pending_lost: u64,
}

impl RingProducer {
    pub(crate) fn new(id: BufferId, region: Arc<Region>) -> Self {
        Self {
            id,
            region,
            pending_lost: 0,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Free bytes the reader has released
    pub fn free_space(&self) -> u64 {
        let head = self.region.load_head();
        let tail = self.region.load_tail();
        self.region.data_size() as u64 - head.wrapping_sub(tail)
    }

    /// Events dropped and not yet reported
    pub fn pending_lost(&self) -> u64 {
        self.pending_lost
    }

    /// Publish one encoded record
    ///
    /// Returns `false` without writing when the ring lacks room.
    pub fn write_raw(&mut self, record: &[u8]) -> bool {
        let size = self.region.data_size();
        if record.len() > size || record.len() as u64 > self.free_space() {
            return false;
        }

        let head = self.region.load_head();
        let at = (head % size as u64) as usize;
        let first = record.len().min(size - at);
        // SAFETY: [head, head + len) is free space; the reader never borrows
        // past head and the tail check above keeps us off unread bytes.
        unsafe {
            self.region.write_data(at, &record[..first]);
            self.region.write_data(0, &record[first..]);
        }
        self.region.store_head(head + record.len() as u64);
        true
    }

    /// Publish a lost-count record
    pub fn write_lost(&mut self, lost: u64) -> bool {
        self.write_raw(&encode_lost(self.id as u64, lost))
    }

    /// Publish one event as a sample record
    ///
    /// A full ring drops the event and counts it; the count is reported in a
    /// lost-count record ahead of the next event that fits.
    pub fn submit(&mut self, event: &[u8]) -> CaptureResult<bool> {
        let record = encode_sample(event)?;
        if self.pending_lost > 0 {
            if (self.free_space() as usize) < record.len() + LOST_RECORD_LEN
                || !self.write_lost(self.pending_lost)
            {
                self.pending_lost += 1;
                return Ok(false);
            }
            self.pending_lost = 0;
        }
        if !self.write_raw(&record) {
            self.pending_lost += 1;
            return Ok(false);
        }
        Ok(true)
    }
}
