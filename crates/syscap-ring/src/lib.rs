//! Shared ring buffer reader for syscap
//!
//! Reads perf-style per-CPU rings written by a kernel producer: the
//! descriptor and memory ordering live in `buffer`, record layout in
//! `record`, checkout/commit in `reader` and record walking in `framer`.
//! `producer` writes the same layout from userspace for simulation and tests.

pub mod buffer;
pub mod error;
pub mod framer;
pub mod platform;
pub mod producer;
pub mod reader;
pub mod record;

#[cfg(target_os = "linux")]
pub mod mmap;

pub use buffer::{readable_len, Piece, RingPointers, RingSpan, SharedBuffer};
pub use error::{CaptureError, CaptureResult, FramingFault};
pub use framer::{EventFramer, FramedEvent};
pub use producer::RingProducer;
pub use reader::RingReader;
pub use record::{RecordHeader, RecordKind};

#[cfg(target_os = "linux")]
pub use mmap::map_perf_buffer;
