use proptest::prelude::*;
use std::sync::Arc;
use syscap_core::{BufferMetrics, EventBuilder};
use syscap_ring::record::{encode_lost, encode_sample};
use syscap_ring::{CaptureError, EventFramer, RingReader, RingSpan, SharedBuffer};

fn sample_event(tid: u64, payload: usize) -> Vec<u8> {
    EventBuilder::new(111)
        .ts(tid * 10)
        .tid(tid)
        .param_i64(0)
        .param_bytes(&vec![tid as u8; payload])
        .build()
}

/// Walk a whole span, returning delivered events or the first error
fn drain(bytes: &[u8]) -> (Vec<Vec<u8>>, Result<(), CaptureError>, u64) {
    let span = RingSpan::from_slice(bytes);
    let mut framer = EventFramer::new(0, Arc::new(BufferMetrics::new()));
    framer.reset(span.len() as u64);

    let mut events = Vec::new();
    let mut skip = false;
    let result = loop {
        match framer.advance(span, skip) {
            Ok(Some(framed)) => {
                events.push(framed.event.as_bytes().to_vec());
                skip = true;
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    let consumed = framer.consumed();
    (events, result, consumed)
}

fn stream() -> (Vec<u8>, Vec<Vec<u8>>, Vec<usize>) {
    let events = vec![sample_event(1, 5), sample_event(2, 40), sample_event(3, 0)];
    let mut bytes = Vec::new();
    let mut boundaries = vec![0];
    for (i, event) in events.iter().enumerate() {
        bytes.extend(encode_sample(event).unwrap());
        boundaries.push(bytes.len());
        if i == 0 {
            bytes.extend(encode_lost(0, 2));
            boundaries.push(bytes.len());
        }
    }
    (bytes, events, boundaries)
}

#[test]
fn test_every_cut_point_is_safe() {
    let (bytes, events, boundaries) = stream();

    for cut in 0..=bytes.len() {
        let (delivered, result, consumed) = drain(&bytes[..cut]);

        // Whatever was delivered is a complete prefix of the written events
        assert!(delivered.len() <= events.len());
        for (got, want) in delivered.iter().zip(&events) {
            assert_eq!(got, want, "cut {}", cut);
        }
        assert!(consumed <= cut as u64);

        if boundaries.contains(&cut) {
            assert!(result.is_ok(), "cut {} on a record boundary", cut);
        } else {
            let err = result.expect_err("truncated record must not frame");
            assert!(err.is_framing(), "cut {}: {}", cut, err);
        }
    }
}

#[test]
fn test_full_stream_delivers_in_order() {
    let (bytes, events, _) = stream();
    let (delivered, result, consumed) = drain(&bytes);
    assert!(result.is_ok());
    assert_eq!(delivered, events);
    assert_eq!(consumed, bytes.len() as u64);
}

#[test]
fn test_records_across_the_wrap() {
    // Counters start 40 bytes before the physical end of a 4096 byte ring
    let (buffer, mut producer) = SharedBuffer::with_producer_at(3, 4096, 4096 - 40).unwrap();
    let events: Vec<Vec<u8>> = (1..=4).map(|tid| sample_event(tid, 30)).collect();
    for event in &events {
        assert!(producer.submit(event).unwrap());
    }

    let metrics = Arc::new(BufferMetrics::new());
    let mut reader = RingReader::new(buffer, metrics.clone());
    let mut framer = EventFramer::new(3, metrics);

    let span = reader.read().unwrap();
    assert!(span.wraps());
    framer.reset(span.len() as u64);

    let mut delivered = Vec::new();
    let mut skip = false;
    while let Some(framed) = framer.advance(span, skip).unwrap() {
        delivered.push(framed.event.as_bytes().to_vec());
        skip = true;
    }
    assert_eq!(delivered, events);
    let consumed = framer.consumed();
    assert_eq!(reader.commit().unwrap(), consumed);
    assert_eq!(reader.buffer().pointers().read_size, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn framing_arbitrary_bytes_never_panics(
        data in proptest::collection::vec(any::<u8>(), 0..1024),
    ) {
        let (_, _, consumed) = drain(&data);
        prop_assert!(consumed <= data.len() as u64);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn framing_corrupted_stream_never_overreads(
        flip_at in 0usize..200,
        flip_to in any::<u8>(),
        cut in 0usize..256,
    ) {
        let (mut bytes, _, _) = stream();
        if flip_at < bytes.len() {
            bytes[flip_at] = flip_to;
        }
        let cut = cut.min(bytes.len());
        let (_, _, consumed) = drain(&bytes[..cut]);
        prop_assert!(consumed <= cut as u64);
    }
}
