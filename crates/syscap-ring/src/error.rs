//! Capture error types

use syscap_core::{BufferId, EventError};
use thiserror::Error;

/// Errors surfaced while reading a shared buffer
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Malformed or truncated record; aborts the current pass over the buffer
    #[error("buffer {buffer}: framing error at offset {offset} ({remaining} bytes readable): {fault}")]
    Framing {
        buffer: BufferId,
        offset: u64,
        remaining: u64,
        fault: FramingFault,
    },

    /// Record kind outside the protocol; aborts the current pass over the buffer
    #[error("buffer {buffer}: unknown record kind {kind} (size {size}) at offset {offset}")]
    UnknownRecord {
        buffer: BufferId,
        offset: u64,
        kind: u32,
        size: u16,
    },

    /// Event could not be rewritten to the current layout; only this event is dropped
    #[error("buffer {buffer}: conversion of {event_type} event (tid {tid}) failed: {message}")]
    Conversion {
        buffer: BufferId,
        tid: u64,
        event_type: &'static str,
        message: String,
    },

    #[error("buffer {buffer}: {outstanding} bytes are still checked out")]
    CheckoutOutstanding { buffer: BufferId, outstanding: u64 },

    #[error("buffer {buffer}: nothing checked out to commit")]
    NothingCheckedOut { buffer: BufferId },

    #[error("record of {size} bytes does not fit the 16-bit record size field")]
    RecordTooLarge { size: usize },

    #[error("invalid buffer layout: {0}")]
    InvalidLayout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Framing-level error (malformed record or unknown kind)
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            CaptureError::Framing { .. } | CaptureError::UnknownRecord { .. }
        )
    }

    /// Per-event conversion error; the stream continues with the next event
    pub fn is_conversion(&self) -> bool {
        matches!(self, CaptureError::Conversion { .. })
    }

    /// Buffer the error belongs to, if any
    pub fn buffer(&self) -> Option<BufferId> {
        match self {
            CaptureError::Framing { buffer, .. }
            | CaptureError::UnknownRecord { buffer, .. }
            | CaptureError::Conversion { buffer, .. }
            | CaptureError::CheckoutOutstanding { buffer, .. }
            | CaptureError::NothingCheckedOut { buffer } => Some(*buffer),
            CaptureError::RecordTooLarge { .. }
            | CaptureError::InvalidLayout(_)
            | CaptureError::Io(_) => None,
        }
    }
}

/// What was wrong with a record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingFault {
    #[error("record declares size 0")]
    ZeroSize,

    #[error("only {remaining} bytes left, less than a record header")]
    ShortHeader { remaining: u64 },

    #[error("record declares {declared} bytes but only {remaining} are readable")]
    Truncated { declared: u16, remaining: u64 },

    #[error("{kind} record of {size} bytes is smaller than its fixed payload")]
    Undersized { kind: &'static str, size: u16 },

    #[error("sample payload of {raw_size} bytes overruns its {size}-byte record")]
    SampleOverrun { raw_size: u32, size: u16 },

    #[error("malformed event: {0}")]
    MalformedEvent(#[from] EventError),
}

/// Result type for capture operations
pub type CaptureResult<T> = Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let framing = CaptureError::Framing {
            buffer: 2,
            offset: 64,
            remaining: 3,
            fault: FramingFault::ShortHeader { remaining: 3 },
        };
        assert!(framing.is_framing());
        assert!(!framing.is_conversion());
        assert_eq!(framing.buffer(), Some(2));

        let conversion = CaptureError::Conversion {
            buffer: 1,
            tid: 7,
            event_type: "read_x",
            message: "bad".to_string(),
        };
        assert!(conversion.is_conversion());
        assert!(!conversion.is_framing());

        assert_eq!(CaptureError::InvalidLayout("x".into()).buffer(), None);
    }

    #[test]
    fn test_framing_message_carries_offsets() {
        let err = CaptureError::Framing {
            buffer: 5,
            offset: 4090,
            remaining: 6,
            fault: FramingFault::Truncated {
                declared: 64,
                remaining: 6,
            },
        };
        let text = err.to_string();
        assert!(text.contains("buffer 5"));
        assert!(text.contains("offset 4090"));
        assert!(text.contains("64 bytes"));
    }
}
