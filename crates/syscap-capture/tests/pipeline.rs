use proptest::prelude::*;
use std::io::Cursor;
use std::sync::Arc;
use syscap_capture::{
    EventGenerator, EventRecorder, EventStream, GeneratorConfig, ReplaySource, StreamSet,
};
use syscap_convert::{Converter, RuleTable};
use syscap_core::metrics::create_metrics;
use syscap_core::{BufferMetrics, EventBuilder, EventType, EventView, SyscapConfig};
use syscap_ring::{RingProducer, SharedBuffer};

fn legacy_converter() -> Converter {
    Converter::new(Arc::new(RuleTable::legacy()))
}

fn stream(size: usize) -> (EventStream, RingProducer) {
    let (buffer, producer) = SharedBuffer::with_producer(0, size).unwrap();
    (
        EventStream::new(buffer, legacy_converter(), Arc::new(BufferMetrics::new())),
        producer,
    )
}

fn drain(stream: &mut EventStream) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(event) = stream.next_event().unwrap() {
        out.push(event.as_bytes().to_vec());
    }
    out
}

fn replay_all(bytes: Vec<u8>) -> Vec<Vec<u8>> {
    let mut replay = ReplaySource::new(
        Cursor::new(bytes),
        legacy_converter(),
        Arc::new(BufferMetrics::new()),
    );
    let mut out = Vec::new();
    while let Some(event) = replay.next_event().unwrap() {
        out.push(event.as_bytes().to_vec());
    }
    out
}

/// Close-enter event with one parameter of `param_len` bytes
fn sized_event(tid: u64, param_len: usize) -> Vec<u8> {
    EventBuilder::new(EventType::CloseE.code())
        .tid(tid)
        .param_bytes(&vec![tid as u8; param_len])
        .build()
}

#[test]
fn test_samples_and_lost_notification() {
    let (mut stream, mut producer) = stream(4096);
    // Record sizes 64, 128, 64, then a lost notification, then 64
    let events = [
        sized_event(1, 24),
        sized_event(2, 88),
        sized_event(3, 24),
        sized_event(4, 24),
    ];
    assert_eq!(events[0].len(), 52);
    assert_eq!(events[1].len(), 116);

    for event in &events[..3] {
        assert!(producer.submit(event).unwrap());
    }
    assert!(producer.write_lost(3));
    assert!(producer.submit(&events[3]).unwrap());
    assert_eq!(producer.free_space(), 4096 - (64 + 128 + 64 + 24 + 64));

    let delivered = drain(&mut stream);
    assert_eq!(delivered, events.to_vec());

    let stats = stream.stats();
    assert_eq!(stats.delivered_events, 4);
    assert_eq!(stats.lost_events, 3);
    assert_eq!(stats.lost_records, 1);
    assert_eq!(stats.framing_errors, 0);
    assert_eq!(producer.free_space(), 4096);
}

#[test]
fn test_many_wraps_keep_order() {
    let (buffer, mut producer) = SharedBuffer::with_producer(0, 256).unwrap();
    let mut stream = EventStream::new(buffer, legacy_converter(), Arc::new(BufferMetrics::new()))
        .with_conversion(false);
    let mut generator = EventGenerator::new();

    let mut submitted = Vec::new();
    let mut delivered = Vec::new();
    for _ in 0..200 {
        for _ in 0..3 {
            let event = generator.next_event();
            assert!(producer.submit(&event).unwrap());
            submitted.push(event);
        }
        delivered.extend(drain(&mut stream));
    }

    assert_eq!(delivered, submitted);
    assert_eq!(stream.stats().framing_errors, 0);
    assert_eq!(producer.pending_lost(), 0);
}

#[test]
fn test_split_remainder_precedes_next_record() {
    let (mut stream, mut producer) = stream(4096);
    let clone = EventBuilder::new(EventType::CloneX.code())
        .tid(8)
        .param_i64(42)
        .param_u32(0x11)
        .param_i64(8)
        .build();
    let close = EventBuilder::new(EventType::CloseX.code())
        .tid(9)
        .param_i64(0)
        .build();
    producer.submit(&clone).unwrap();
    producer.submit(&close).unwrap();

    let types: Vec<u16> = drain(&mut stream)
        .iter()
        .map(|b| EventView::parse(b).unwrap().event_type())
        .collect();
    assert_eq!(
        types,
        vec![
            EventType::CloneX.code(),
            EventType::CloneChildX.code(),
            EventType::CloseX.code()
        ]
    );
}

#[test]
fn test_merge_partner_survives_commit() {
    let (mut stream, mut producer) = stream(4096);
    let enter = EventBuilder::new(EventType::ReadE.code())
        .tid(3)
        .param_i64(9)
        .param_u32(512)
        .build();
    producer.submit(&enter).unwrap();
    assert_eq!(drain(&mut stream).len(), 1);

    let exit = EventBuilder::new(EventType::ReadX.code())
        .tid(3)
        .param_i64(2)
        .param_bytes(b"ok")
        .build();
    producer.submit(&exit).unwrap();
    let merged = drain(&mut stream);
    let merged = EventView::parse(&merged[0]).unwrap();
    assert_eq!(merged.nparams(), 4);
    assert_eq!(merged.param_i64(2), Some(9));
    assert_eq!(merged.param_u64(3), Some(512));
}

#[test]
fn test_live_and_replay_are_identical() {
    let dir = tempfile::tempdir().unwrap();
    let raw_path = dir.path().join("raw.scap");
    let live_path = dir.path().join("live.scap");

    let (mut stream, mut producer) = stream(64 * 1024);
    let mut generator = EventGenerator::new();
    let mut raw = EventRecorder::create(&raw_path).unwrap();
    for _ in 0..200 {
        let event = generator.next_event();
        raw.record(&EventView::parse(&event).unwrap()).unwrap();
        assert!(producer.submit(&event).unwrap());
    }
    raw.finish().unwrap();

    let mut live = Vec::new();
    let mut recorder = EventRecorder::create(&live_path).unwrap();
    while let Some(event) = stream.next_event().unwrap() {
        recorder.record(event.view()).unwrap();
        live.push(event.as_bytes().to_vec());
    }
    recorder.finish().unwrap();
    assert!(stream.stats().converted_events > 0);

    let metrics = Arc::new(BufferMetrics::new());
    let mut replay = ReplaySource::open(&raw_path, legacy_converter(), metrics.clone()).unwrap();
    let mut replayed = Vec::new();
    while let Some(event) = replay.next_event().unwrap() {
        replayed.push(event.as_bytes().to_vec());
    }
    assert_eq!(replayed, live);
    assert_eq!(metrics.snapshot().converted_events, stream.stats().converted_events);

    // Stored output is already current and replays unchanged
    let mut stored = ReplaySource::open(&live_path, legacy_converter(), Arc::new(BufferMetrics::new()))
        .unwrap();
    let mut again = Vec::new();
    while let Some(event) = stored.next_event().unwrap() {
        assert!(!event.was_converted());
        again.push(event.as_bytes().to_vec());
    }
    assert_eq!(again, live);
}

#[test]
fn test_stream_set_drains_every_buffer() {
    let mut config = SyscapConfig::default();
    config.capture.buffer_count = 4;
    config.capture.data_pages = 4;
    let (mut set, mut producers) =
        StreamSet::open_simulated(&config, Arc::new(RuleTable::legacy()), create_metrics()).unwrap();

    let mut submitted = 0;
    for (cpu, producer) in producers.iter_mut().enumerate() {
        let mut generator = EventGenerator::with_config(GeneratorConfig {
            base_tid: cpu as u64 * 100,
            legacy: false,
            ..Default::default()
        });
        submitted += generator.fill(producer, 20).unwrap();
    }

    let mut delivered = 0;
    while set.next_event().unwrap().is_some() {
        delivered += 1;
    }
    assert_eq!(delivered, submitted);
    let totals = set.metrics().totals();
    assert_eq!(totals.delivered_events, submitted as u64);
    assert_eq!(totals.converted_events, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn live_output_matches_replay_for_any_batching(
        batches in prop::collection::vec(1usize..6, 1..40),
        commit_mid in any::<bool>(),
    ) {
        let (mut stream, mut producer) = stream(4096);
        let mut generator = EventGenerator::new();
        let mut submitted = Vec::new();
        let mut live = Vec::new();

        for batch in batches {
            for _ in 0..batch {
                let event = generator.next_event();
                prop_assert!(producer.submit(&event).unwrap());
                submitted.extend_from_slice(&event);
            }
            if commit_mid {
                if let Some(event) = stream.next_event().unwrap() {
                    live.push(event.as_bytes().to_vec());
                }
                stream.commit();
            }
            live.extend(drain(&mut stream));
        }

        prop_assert_eq!(live, replay_all(submitted));
        prop_assert_eq!(stream.stats().framing_errors, 0);
    }
}
