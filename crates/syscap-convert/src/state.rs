//! Conversion State
//!
//! Per-thread scratch that survives between conversion passes: the legacy
//! enter event waiting for its exit, or the second half of a split event
//! waiting for the next pull. Holds at most one entry per thread id.

use std::collections::HashMap;
use syscap_core::config::DEFAULT_MAX_PENDING_CONTEXTS;
use tracing::{debug, warn};

/// Why an event is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StashKind {
    /// Legacy enter event whose fields the matching exit absorbs
    EnterPartner,
    /// Second event of a split, delivered on the next pull
    SplitRemainder,
}

/// A held event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub kind: StashKind,
    pub event: Vec<u8>,
    seq: u64,
}

/// Thread id -> held event
#[derive(Debug)]
pub struct ConversionState {
    entries: HashMap<u64, PendingEvent>,
    capacity: usize,
    next_seq: u64,
    evictions: u64,
}

impl Default for ConversionState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING_CONTEXTS)
    }
}

impl ConversionState {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            next_seq: 0,
            evictions: 0,
        }
    }

    /// Hold `event` for `tid`, replacing whatever was held before
    ///
    /// When the table is full the oldest entry is dropped.
    pub fn store(&mut self, tid: u64, kind: StashKind, event: &[u8]) -> Option<PendingEvent> {
        if !self.entries.contains_key(&tid) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.seq)
                .map(|(tid, _)| *tid)
            {
                warn!(
                    "Conversion state full ({} threads), dropping entry of tid {}",
                    self.capacity, oldest
                );
                self.entries.remove(&oldest);
                self.evictions += 1;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let replaced = self.entries.insert(
            tid,
            PendingEvent {
                kind,
                event: event.to_vec(),
                seq,
            },
        );
        if let Some(old) = &replaced {
            debug!(tid, ?old.kind, "replaced held event");
        }
        replaced
    }

    /// Remove and return the entry for `tid`
    pub fn take(&mut self, tid: u64) -> Option<PendingEvent> {
        self.entries.remove(&tid)
    }

    /// Remove the entry for `tid` only if it is of `kind`
    pub fn take_kind(&mut self, tid: u64, kind: StashKind) -> Option<Vec<u8>> {
        match self.entries.get(&tid) {
            Some(entry) if entry.kind == kind => self.entries.remove(&tid).map(|e| e.event),
            _ => None,
        }
    }

    /// Put back an entry removed by a conversion that later failed
    pub(crate) fn restore(&mut self, tid: u64, entry: PendingEvent) {
        self.entries.insert(tid, entry);
    }

    /// Inspect the entry for `tid`
    pub fn get(&self, tid: u64) -> Option<&PendingEvent> {
        self.entries.get(&tid)
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Keep only entries for which `keep` returns true, e.g. live threads
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(u64, &PendingEvent) -> bool,
    {
        self.entries.retain(|tid, entry| keep(*tid, entry));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries dropped because the table was full
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
