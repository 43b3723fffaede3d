//! Ring record layout
//!
//! Records follow the perf ring convention: an 8-byte header
//! `{ kind: u32, misc: u16, size: u16 }` where `size` covers the whole record,
//! followed by a kind-specific payload. Records are 8-byte aligned.

use crate::error::{CaptureError, CaptureResult};

/// Size of a record header
pub const RECORD_HEADER_LEN: usize = 8;

/// Record alignment
pub const RECORD_ALIGN: usize = 8;

/// Lost-count notification kind
pub const PERF_RECORD_LOST: u32 = 2;

/// Data sample kind
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// Header plus the `u32` raw size that prefixes sample data
pub const SAMPLE_PREFIX_LEN: usize = RECORD_HEADER_LEN + 4;

/// Header plus `{ id: u64, lost: u64 }`
pub const LOST_RECORD_LEN: usize = RECORD_HEADER_LEN + 16;

/// Kind of a ring record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    /// Payload is one framed event
    Sample,
    /// Payload is a count of events the producer dropped
    Lost,
    /// Anything else is a protocol violation
    Unknown(u32),
}

impl From<u32> for RecordKind {
    fn from(kind: u32) -> Self {
        match kind {
            PERF_RECORD_SAMPLE => RecordKind::Sample,
            PERF_RECORD_LOST => RecordKind::Lost,
            other => RecordKind::Unknown(other),
        }
    }
}

impl RecordKind {
    pub fn code(self) -> u32 {
        match self {
            RecordKind::Sample => PERF_RECORD_SAMPLE,
            RecordKind::Lost => PERF_RECORD_LOST,
            RecordKind::Unknown(code) => code,
        }
    }
}

/// Decoded record header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

impl RecordHeader {
    pub fn parse(raw: [u8; RECORD_HEADER_LEN]) -> Self {
        Self {
            kind: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            misc: u16::from_le_bytes([raw[4], raw[5]]),
            size: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut out = [0u8; RECORD_HEADER_LEN];
        out[0..4].copy_from_slice(&self.kind.to_le_bytes());
        out[4..6].copy_from_slice(&self.misc.to_le_bytes());
        out[6..8].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn kind(&self) -> RecordKind {
        RecordKind::from(self.kind)
    }
}

/// Round `len` up to the record alignment
pub fn align_record(len: usize) -> usize {
    (len + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

/// Encode a data sample record carrying `event`
///
/// The raw size includes the alignment padding, as the kernel reports it.
pub fn encode_sample(event: &[u8]) -> CaptureResult<Vec<u8>> {
    let size = align_record(SAMPLE_PREFIX_LEN + event.len());
    let record_size =
        u16::try_from(size).map_err(|_| CaptureError::RecordTooLarge { size })?;
    let raw_size = (size - SAMPLE_PREFIX_LEN) as u32;

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(
        &RecordHeader {
            kind: PERF_RECORD_SAMPLE,
            misc: 0,
            size: record_size,
        }
        .encode(),
    );
    out.extend_from_slice(&raw_size.to_le_bytes());
    out.extend_from_slice(event);
    out.resize(size, 0);
    Ok(out)
}

/// Encode a lost-count notification record
pub fn encode_lost(id: u64, lost: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOST_RECORD_LEN);
    out.extend_from_slice(
        &RecordHeader {
            kind: PERF_RECORD_LOST,
            misc: 0,
            size: LOST_RECORD_LEN as u16,
        }
        .encode(),
    );
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&lost.to_le_bytes());
    out
}
