//! Synthetic event generator
//!
//! Produces deterministic syscall event sequences for exercising the pipeline
//! without a kernel producer. Events come in either the legacy layouts the
//! built-in conversion table upgrades or the current layouts, so the demo
//! and the tests can drive both paths.

use std::collections::VecDeque;
use syscap_core::{EventBuilder, EventType};
use syscap_ring::{CaptureResult, RingProducer};
use tracing::debug;

/// Configuration for synthetic event generation
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Number of simulated threads, used in rotation
    pub threads: u64,

    /// Thread id of the first simulated thread
    pub base_tid: u64,

    /// Emit legacy layouts instead of current ones
    pub legacy: bool,

    /// Timestamp of the first event in nanoseconds
    pub start_ts: u64,

    /// Timestamp increment between events
    pub ts_step: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            base_tid: 1000,
            legacy: true,
            start_ts: 1_000_000,
            ts_step: 1_000,
        }
    }
}

/// Syscall sequences the generator cycles through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Read,
    Setreuid,
    Mmap,
    Clone,
    Close,
}

impl Scenario {
    pub const ALL: [Scenario; 5] = [
        Scenario::Read,
        Scenario::Setreuid,
        Scenario::Mmap,
        Scenario::Clone,
        Scenario::Close,
    ];
}

/// Deterministic event source
pub struct EventGenerator {
    config: GeneratorConfig,
    cycle: u64,
    ts: u64,
    queue: VecDeque<Vec<u8>>,
    generated: u64,
}

impl EventGenerator {
    pub fn new() -> Self {
        Self::with_config(GeneratorConfig::default())
    }

    pub fn with_config(config: GeneratorConfig) -> Self {
        let ts = config.start_ts;
        Self {
            config,
            cycle: 0,
            ts,
            queue: VecDeque::new(),
            generated: 0,
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Events handed out so far
    pub fn generated(&self) -> u64 {
        self.generated
    }

    /// Next encoded event; the sequence never ends
    pub fn next_event(&mut self) -> Vec<u8> {
        if self.queue.is_empty() {
            let scenario = Scenario::ALL[(self.cycle % Scenario::ALL.len() as u64) as usize];
            let tid = self.config.base_tid + self.cycle % self.config.threads.max(1);
            let events = self.scenario(scenario, tid);
            self.queue.extend(events);
            self.cycle += 1;
        }
        self.generated += 1;
        self.queue.pop_front().unwrap_or_default()
    }

    /// Events for one run of `scenario` on thread `tid`
    pub fn scenario(&mut self, scenario: Scenario, tid: u64) -> Vec<Vec<u8>> {
        let n = self.cycle;
        let legacy = self.config.legacy;
        let fd = 3 + (n % 16) as i64;

        let builders = match scenario {
            Scenario::Read => {
                let data = format!("chunk-{}", n).into_bytes();
                if legacy {
                    vec![
                        EventBuilder::new(EventType::ReadE.code())
                            .param_i64(fd)
                            .param_u32(4096),
                        EventBuilder::new(EventType::ReadX.code())
                            .param_i64(data.len() as i64)
                            .param_bytes(&data),
                    ]
                } else {
                    vec![
                        EventBuilder::new(EventType::ReadE.code()),
                        EventBuilder::new(EventType::ReadX.code())
                            .param_i64(data.len() as i64)
                            .param_bytes(&data)
                            .param_i64(fd)
                            .param_u32(4096),
                    ]
                }
            }
            Scenario::Setreuid => {
                let uid = 1000 + (n % 8) as u32;
                if legacy {
                    vec![
                        EventBuilder::new(EventType::SetreuidE.code())
                            .param_u32(uid)
                            .param_u32(uid),
                        EventBuilder::new(EventType::SetreuidX.code()).param_i64(0),
                    ]
                } else {
                    vec![
                        EventBuilder::new(EventType::SetreuidE.code()),
                        EventBuilder::new(EventType::SetreuidX.code())
                            .param_i64(0)
                            .param_u32(uid)
                            .param_u32(uid),
                    ]
                }
            }
            Scenario::Mmap => {
                let res = if n % 7 == 0 { -12 } else { 0x7f00_0000 };
                let exit = if legacy {
                    EventBuilder::new(EventType::MmapX.code()).param_i32(res)
                } else {
                    EventBuilder::new(EventType::MmapX.code())
                        .param_i64(res as i64)
                        .param_u32(0)
                };
                vec![EventBuilder::new(EventType::MmapE.code()), exit]
            }
            Scenario::Clone => {
                let child = (tid + 10_000) as i64;
                if legacy {
                    vec![
                        EventBuilder::new(EventType::CloneE.code()),
                        EventBuilder::new(EventType::CloneX.code())
                            .param_i64(child)
                            .param_u32(0x11)
                            .param_i64(tid as i64),
                    ]
                } else {
                    vec![
                        EventBuilder::new(EventType::CloneE.code()),
                        EventBuilder::new(EventType::CloneX.code())
                            .param_i64(child)
                            .param_u32(0x11),
                        EventBuilder::new(EventType::CloneChildX.code())
                            .param_i64(0)
                            .param_i64(tid as i64),
                    ]
                }
            }
            Scenario::Close => vec![
                EventBuilder::new(EventType::CloseE.code()).param_i64(fd),
                EventBuilder::new(EventType::CloseX.code()).param_i64(0),
            ],
        };

        builders
            .into_iter()
            .map(|builder| {
                let ts = self.ts;
                self.ts += self.config.ts_step;
                builder.ts(ts).tid(tid).build()
            })
            .collect()
    }

    /// Submit up to `limit` events, stopping at the first that does not fit
    ///
    /// The event that did not fit is dropped and reported by the producer as
    /// lost. Returns the number of events written.
    pub fn fill(&mut self, producer: &mut RingProducer, limit: usize) -> CaptureResult<usize> {
        let mut written = 0;
        while written < limit {
            let event = self.next_event();
            if !producer.submit(&event)? {
                debug!(
                    buffer = producer.id(),
                    "ring full after {} events", written
                );
                break;
            }
            written += 1;
        }
        Ok(written)
    }
}

impl Default for EventGenerator {
    fn default() -> Self {
        Self::new()
    }
}
