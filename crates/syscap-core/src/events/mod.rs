//! Event wire layout
//!
//! Every event is self-delimiting: a packed little-endian header, a table of
//! `u16` parameter lengths, then the concatenated parameter values.
//!
//! ```text
//! +--------+---------+--------+---------+------------+----------------+-----------+
//! | ts u64 | tid u64 | len u32| type u16| nparams u32| lens u16 * n   | values... |
//! +--------+---------+--------+---------+------------+----------------+-----------+
//! ```
//!
//! The layout revision of an event type is identified by its parameter count:
//! a `(type, nparams)` pair names exactly one historical layout.

pub mod builder;
pub mod catalog;
pub mod header;

pub use builder::{EventBuilder, EventWriter, MAX_PARAM_LEN};
pub use catalog::EventType;
pub use header::{EventHeader, EventView, Params, EVENT_HEADER_LEN, PARAM_LEN_SIZE};

use thiserror::Error;

/// Event layout errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("event too short: need {needed} bytes, have {available}")]
    TooShort { needed: usize, available: usize },

    #[error("declared event length {declared} exceeds available {available} bytes")]
    LengthOverrun { declared: usize, available: usize },

    #[error("parameter table of {nparams} entries does not fit in {len} bytes")]
    ParamTableOverrun { nparams: u32, len: usize },

    #[error("parameter {index} ends at byte {end}, past event length {len}")]
    ParamOverrun { index: usize, end: usize, len: usize },

    #[error("parameter {index} is {len} bytes, longer than {max}")]
    ParamTooLong { index: usize, len: usize, max: usize },
}
