//! syscap core - event layout, configuration, and statistics
//!
//! This crate provides the foundational types shared by every pipeline stage:
//!
//! - **Events**: the scap-style on-wire event layout and the event-type catalog
//! - **Config**: TOML configuration with discovery and environment overrides
//! - **Metrics**: per-buffer counters, pollable from any thread

pub mod config;
pub mod events;
pub mod metrics;

// Re-export commonly used types
pub use config::{ConfigLoader, SyscapConfig};
pub use events::{EventBuilder, EventError, EventHeader, EventType, EventView};
pub use metrics::{BufferMetrics, BufferStats, MetricsCollector, SharedMetrics};

/// Identifier of one shared buffer (one per monitored CPU)
pub type BufferId = u32;

/// Library version
pub const SYSCAP_VERSION: &str = env!("CARGO_PKG_VERSION");
