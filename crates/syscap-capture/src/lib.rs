//! Event pipeline for syscap
//!
//! Ties the ring reader, framer, and converter together behind a single
//! pull interface:
//!
//! - **EventStream**: one buffer, one event per pull, current layout only
//! - **StreamSet**: one stream per CPU, polled round-robin
//! - **Replay**: stored streams written and read back through the same converter
//! - **EventGenerator**: deterministic synthetic producer for demos and tests

pub mod replay;
pub mod set;
pub mod stream;
pub mod test_generator;

pub use replay::{EventRecorder, ReplaySource};
pub use set::StreamSet;
pub use stream::{Event, EventStream};
pub use test_generator::{EventGenerator, GeneratorConfig, Scenario};
