//! Event schema converter for syscap
//!
//! Events recorded by older producers carry older parameter layouts. This
//! crate rewrites them into the current layout before any consumer sees them:
//!
//! - **RuleTable**: one rule per legacy `(type, nparams)` layout
//! - **ConversionState**: per-thread events held between passes
//! - **Converter**: single passes and the bounded multi-pass driver

pub mod converter;
pub mod state;
pub mod table;

pub use converter::{ConversionResult, Converter, ConverterStats, Normalized, Scratch};
pub use state::{ConversionState, PendingEvent, StashKind};
pub use table::{Action, Layout, ParamInstr, RuleError, RuleTable};
