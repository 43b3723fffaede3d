//! One stream per CPU buffer, polled round-robin
//!
//! No ordering is imposed across buffers; consumers needing a global order
//! sort by the embedded timestamp themselves.

use crate::stream::{Event, EventStream};
use std::sync::Arc;
use syscap_convert::{Converter, RuleTable};
use syscap_core::{BufferId, SharedMetrics, SyscapConfig};
use syscap_ring::{platform, CaptureResult, RingProducer, SharedBuffer};
use tracing::info;

/// Round-robin set of event streams
pub struct StreamSet {
    streams: Vec<EventStream>,
    next: usize,
    metrics: SharedMetrics,
}

impl StreamSet {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            streams: Vec::new(),
            next: 0,
            metrics,
        }
    }

    /// Heap-backed buffers with in-process producers, one per configured CPU
    pub fn open_simulated(
        config: &SyscapConfig,
        table: Arc<RuleTable>,
        metrics: SharedMetrics,
    ) -> CaptureResult<(Self, Vec<RingProducer>)> {
        let count = match config.capture.buffer_count {
            0 => platform::online_cpus(),
            n => n,
        };
        let data_size = config.capture.data_size();

        let mut set = Self::new(metrics);
        let mut producers = Vec::with_capacity(count);
        for id in 0..count as BufferId {
            let (buffer, producer) = SharedBuffer::with_producer(id, data_size)?;
            set.add_buffer(buffer, config, table.clone());
            producers.push(producer);
        }
        info!(
            "Opened {} simulated buffers of {} bytes",
            count, data_size
        );
        Ok((set, producers))
    }

    /// Map the rings of already opened perf event fds, one per CPU
    #[cfg(target_os = "linux")]
    pub fn open_perf(
        fds: &[std::os::fd::RawFd],
        config: &SyscapConfig,
        table: Arc<RuleTable>,
        metrics: SharedMetrics,
    ) -> CaptureResult<Self> {
        let mut set = Self::new(metrics);
        for (id, fd) in fds.iter().enumerate() {
            let buffer = syscap_ring::map_perf_buffer(id as BufferId, *fd, config.capture.data_pages)?;
            set.add_buffer(buffer, config, table.clone());
        }
        info!("Opened {} perf buffers", fds.len());
        Ok(set)
    }

    fn add_buffer(&mut self, buffer: SharedBuffer, config: &SyscapConfig, table: Arc<RuleTable>) {
        let metrics = self.metrics.buffer(buffer.id());
        let converter = Converter::from_settings(table, &config.converter);
        let stream =
            EventStream::new(buffer, converter, metrics).with_conversion(config.converter.enabled);
        self.streams.push(stream);
    }

    /// Add a stream built elsewhere
    pub fn push(&mut self, stream: EventStream) {
        self.streams.push(stream);
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn streams(&self) -> &[EventStream] {
        &self.streams
    }

    pub fn stream_mut(&mut self, index: usize) -> Option<&mut EventStream> {
        self.streams.get_mut(index)
    }

    /// Pull the next event from whichever buffer has one
    ///
    /// Each call starts at the buffer after the one that answered last.
    /// An error from one buffer is returned as is; the next call moves on
    /// to the following buffer.
    pub fn next_event(&mut self) -> CaptureResult<Option<Event<'_>>> {
        let count = self.streams.len();
        let mut ready = None;
        for attempt in 0..count {
            let index = (self.next + attempt) % count;
            self.next = (index + 1) % count;
            if self.streams[index].prepare()? {
                ready = Some(index);
                break;
            }
        }

        match ready {
            Some(index) => self.streams[index].deliver(),
            None => Ok(None),
        }
    }

    /// Commit every stream's delivered records
    pub fn commit(&mut self) -> u64 {
        self.streams.iter_mut().map(|s| s.commit()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syscap_core::metrics::create_metrics;
    use syscap_core::{EventBuilder, EventType};

    fn config(buffers: usize) -> SyscapConfig {
        let mut config = SyscapConfig::default();
        config.capture.buffer_count = buffers;
        config.capture.data_pages = 1;
        config
    }

    fn event(tid: u64) -> Vec<u8> {
        EventBuilder::new(EventType::CloseE.code())
            .tid(tid)
            .param_i64(3)
            .build()
    }

    #[test]
    fn test_round_robin() {
        let (mut set, mut producers) =
            StreamSet::open_simulated(&config(3), Arc::new(RuleTable::legacy()), create_metrics())
                .unwrap();
        for (cpu, producer) in producers.iter_mut().enumerate() {
            for n in 0..2 {
                producer.submit(&event(cpu as u64 * 10 + n)).unwrap();
            }
        }

        let mut seen = Vec::new();
        while let Some(event) = set.next_event().unwrap() {
            seen.push((event.buffer(), event.tid()));
        }
        assert_eq!(
            seen,
            vec![(0, 0), (1, 10), (2, 20), (0, 1), (1, 11), (2, 21)]
        );
        assert_eq!(set.metrics().totals().delivered_events, 6);
    }

    #[test]
    fn test_skips_idle_buffers() {
        let (mut set, mut producers) =
            StreamSet::open_simulated(&config(4), Arc::new(RuleTable::legacy()), create_metrics())
                .unwrap();
        producers[2].submit(&event(7)).unwrap();
        let event = set.next_event().unwrap().unwrap();
        assert_eq!(event.buffer(), 2);
        assert!(set.next_event().unwrap().is_none());
    }

    #[test]
    fn test_empty_set() {
        let mut set = StreamSet::new(create_metrics());
        assert!(set.is_empty());
        assert!(set.next_event().unwrap().is_none());
    }
}
