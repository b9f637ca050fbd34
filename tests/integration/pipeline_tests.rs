//! End-to-end telemetry pipeline: poll the inverter, accumulate samples into
//! a batch, run the compression tournament, and seal the result in the
//! Security Envelope — the same chain [`crate::main`]'s sensor-poll and
//! compression tasks run, exercised here in one thread without the
//! supervisor's timing.

use std::collections::HashMap;

use ecowatt::batch::{CompressedRing, DEFAULT_BATCH_CAPACITY};
use ecowatt::compression::stats::AdaptiveStats;
use ecowatt::compression::tournament;
use ecowatt::envelope::{self, EnvelopeKeys};
use ecowatt::polling::{poll_once, BatchAccumulator, PollOutcome, SampleQueue, SAMPLE_QUEUE_CAPACITY};
use ecowatt::registers;
use ecowatt::store::PersistentStorePort;

use crate::mock_hw::MockTransport;

const DEVICE_ADDR: u8 = 0x01;

/// Build a valid "read holding registers" response frame for `values`
/// (one u16 per requested register, in request order), CRC included.
fn read_response_frame(values: &[u16]) -> Vec<u8> {
    let mut body = vec![DEVICE_ADDR, 0x03, (values.len() * 2) as u8];
    for v in values {
        body.extend_from_slice(&v.to_be_bytes());
    }
    let crc = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS).checksum(&body);
    body.extend_from_slice(&crc.to_le_bytes());
    body
}

#[test]
fn poll_batch_compress_seal_round_trips_the_samples() {
    let registers = vec![0x0000u16, 0x0001, 0x0002];
    let mut transport = MockTransport::new();
    // One batch's worth of poll ticks (default capacity 5), all full reads.
    for _ in 0..DEFAULT_BATCH_CAPACITY {
        transport.queue_response(read_response_frame(&[2300, 10, 5000]));
    }

    let mut queue = SampleQueue::new(SAMPLE_QUEUE_CAPACITY);
    let mut accumulator = BatchAccumulator::new(DEFAULT_BATCH_CAPACITY);
    let mut filled_batch = None;

    for tick in 0..DEFAULT_BATCH_CAPACITY {
        let outcome = poll_once(&mut transport, &registers, &mut queue, tick as u64 * 1_000);
        assert!(matches!(outcome, PollOutcome::Sampled), "expected Sampled, got {outcome:?}");
        let samples = queue.drain_all();
        assert_eq!(samples.len(), registers.len());
        if let Some(full) = accumulator.offer(&registers, &samples) {
            filled_batch = Some(full);
        }
    }

    let batch = filled_batch.expect("batch should have filled after DEFAULT_BATCH_CAPACITY ticks");
    assert!(batch.is_full());
    let samples: Vec<_> = batch.to_linear_array().iter().filter_map(|s| *s).collect();
    assert_eq!(samples.len(), DEFAULT_BATCH_CAPACITY * registers.len());

    let register_types: HashMap<u16, _> =
        registers::addresses().iter().map(|&addr| (addr, registers::type_of(addr))).collect();
    let mut stats = AdaptiveStats::new();
    let packet = tournament::run(&samples, &register_types, &mut stats);
    assert!(!packet.bytes.is_empty());

    let mut store = ecowatt::adapters::nvs::NvsAdapter::new().unwrap();
    let counter = envelope::next_counter(&mut store).unwrap();
    let keys = EnvelopeKeys { hmac_key: b"integration-test-key".to_vec(), aes_key: None };
    let record = envelope::seal(counter, &packet.bytes, &keys);

    let opened = envelope::open(&record, &keys, 0).expect("seal/open should round-trip");
    assert_eq!(opened, packet.bytes);

    let mut ring = CompressedRing::new();
    assert!(!ring.push(packet), "first push into an empty ring should not overwrite anything");
    let drained = ring.drain_all();
    assert_eq!(drained.len(), 1);
}

#[test]
fn crc_error_is_recovered_on_the_opportunistic_retry() {
    let registers = vec![0x0000u16];
    let mut transport = MockTransport::new();
    let mut corrupt = read_response_frame(&[100]);
    *corrupt.last_mut().unwrap() ^= 0xFF;
    transport.queue_response(corrupt);
    transport.queue_response(read_response_frame(&[100]));

    let mut queue = SampleQueue::new(SAMPLE_QUEUE_CAPACITY);
    let outcome = poll_once(&mut transport, &registers, &mut queue, 0);
    assert!(matches!(outcome, PollOutcome::Sampled | PollOutcome::Recovered { .. }));
}
