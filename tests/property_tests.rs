//! Property and fuzz-style tests for robustness of core data structures.
//!
//! Runs on host (x86_64) only — proptest is not available for ESP32 targets.
//! On ESP32, these tests are compiled out.

#![cfg(not(target_os = "espidf"))]

use ecowatt::batch::{CompressedPacket, CompressedRing, RING_CAPACITY};
use ecowatt::envelope::{self, EnvelopeKeys};
use ecowatt::protocol::{self, ValidationOutcome};
use proptest::prelude::*;

// ── Security Envelope round trip ──────────────────────────────

proptest! {
    /// For any payload and key, sealing then opening with a lower last-seen
    /// counter always recovers the original payload unchanged.
    #[test]
    fn seal_open_round_trips_the_payload(
        counter in 1u32..=u32::MAX,
        payload in proptest::collection::vec(0u8..=255u8, 0..=256),
        hmac_key in proptest::collection::vec(1u8..=255u8, 1..=32),
    ) {
        let keys = EnvelopeKeys { hmac_key, aes_key: None };
        let record = envelope::seal(counter, &payload, &keys);
        let opened = envelope::open(&record, &keys, counter - 1);
        prop_assert_eq!(opened, Ok(payload));
    }

    /// The same round trip with AES-128-CBC encryption enabled.
    #[test]
    fn seal_open_round_trips_under_encryption(
        counter in 1u32..=u32::MAX,
        payload in proptest::collection::vec(0u8..=255u8, 0..=256),
        hmac_key in proptest::collection::vec(1u8..=255u8, 1..=32),
        aes_key in proptest::array::uniform16(0u8..=255u8),
    ) {
        let keys = EnvelopeKeys { hmac_key, aes_key: Some(aes_key) };
        let record = envelope::seal(counter, &payload, &keys);
        let opened = envelope::open(&record, &keys, counter - 1);
        prop_assert_eq!(opened, Ok(payload));
    }

    /// A counter at or below the last-seen value is always rejected,
    /// regardless of whether the record is otherwise well-formed.
    #[test]
    fn stale_or_repeated_counters_are_always_rejected(
        counter in 0u32..=1000u32,
        last_seen in 0u32..=1000u32,
        payload in proptest::collection::vec(0u8..=255u8, 0..=64),
        hmac_key in proptest::collection::vec(1u8..=255u8, 1..=32),
    ) {
        prop_assume!(counter <= last_seen);
        let keys = EnvelopeKeys { hmac_key, aes_key: None };
        let record = envelope::seal(counter, &payload, &keys);
        prop_assert!(envelope::open(&record, &keys, last_seen).is_err());
    }

    /// Flipping any single byte of the MAC invalidates the record.
    #[test]
    fn a_tampered_mac_is_rejected(
        counter in 1u32..=1000u32,
        payload in proptest::collection::vec(0u8..=255u8, 1..=64),
        hmac_key in proptest::collection::vec(1u8..=255u8, 1..=32),
        flip_index in 0usize..32,
    ) {
        let keys = EnvelopeKeys { hmac_key, aes_key: None };
        let mut record = envelope::seal(counter, &payload, &keys);
        let mut mac_bytes = hex::decode(&record.mac_hex).unwrap();
        mac_bytes[flip_index] ^= 0x01;
        record.mac_hex = hex::encode(mac_bytes);
        prop_assert!(envelope::open(&record, &keys, 0).is_err());
    }
}

// ── Register protocol framing ─────────────────────────────────

proptest! {
    /// Every frame `build_read_frame` produces passes `validate_response`
    /// unmodified (the same CRC routine builds and checks it), and decodes
    /// back the requested register count.
    #[test]
    fn read_frame_roundtrips_through_validate_and_decode(
        device_addr in 1u8..=247u8,
        start_register in 0u16..=u16::MAX,
        values in proptest::collection::vec(0u16..=u16::MAX, 1..=20),
    ) {
        let count = values.len() as u16;
        let mut request = [0u8; protocol::MAX_FRAME_LEN];
        let n = protocol::build_read_frame(device_addr, start_register, count, &mut request);
        prop_assert!(n.is_some());

        // Simulate the inverter's reply: echo address/function, pack values.
        let mut body = vec![device_addr, 0x03, (values.len() * 2) as u8];
        for v in &values {
            body.extend_from_slice(&v.to_be_bytes());
        }
        let crc = crc::Crc::<u16>::new(&crc::CRC_16_MODBUS).checksum(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        prop_assert_eq!(protocol::validate_response(&body), ValidationOutcome::Ok);

        let requested: Vec<u16> = (0..count).map(|i| start_register.wrapping_add(i)).collect();
        let decoded = protocol::decode_read_response(&body, &requested);
        prop_assert_eq!(decoded.len(), values.len());
        for (rv, expected) in decoded.iter().zip(values.iter()) {
            prop_assert_eq!(rv.value, *expected);
        }
    }

    /// Flipping any single byte of a validated frame almost always breaks
    /// its CRC; when it does, validation must report `CrcError`, never a
    /// silent pass.
    #[test]
    fn a_single_bit_flip_is_caught_by_the_crc(
        device_addr in 1u8..=247u8,
        register in 0u16..=u16::MAX,
        value in 0u16..=u16::MAX,
        flip_index in 0usize..8,
    ) {
        let mut frame = [0u8; protocol::MAX_FRAME_LEN];
        let n = protocol::build_write_frame(device_addr, register, value, &mut frame).unwrap();
        let mut corrupted = frame[..n].to_vec();
        corrupted[flip_index] ^= 0x01;

        prop_assert_eq!(protocol::validate_response(&corrupted), ValidationOutcome::CrcError);
    }
}

// ── Compressed packet ring buffer ─────────────────────────────

proptest! {
    /// Pushing more packets than `RING_CAPACITY` never panics; the ring
    /// always holds exactly `min(pushed, RING_CAPACITY)` packets afterward,
    /// and draining always returns them in the order they were pushed
    /// (oldest surviving entry first).
    #[test]
    fn ring_never_exceeds_capacity_and_drains_in_order(
        codec_ids in proptest::collection::vec(0u8..=255u8, 0..=80),
    ) {
        let mut ring = CompressedRing::new();
        for (i, codec_id) in codec_ids.iter().enumerate() {
            ring.push(CompressedPacket { codec_id: *codec_id, bytes: vec![i as u8] });
        }

        prop_assert_eq!(ring.size(), codec_ids.len().min(RING_CAPACITY));

        let drained = ring.drain_all();
        let expected_len = codec_ids.len().min(RING_CAPACITY);
        prop_assert_eq!(drained.len(), expected_len);

        // Every surviving packet is one of the last RING_CAPACITY pushed, in push order.
        let expected_tail = &codec_ids[codec_ids.len().saturating_sub(RING_CAPACITY)..];
        let got: Vec<u8> = drained.iter().map(|p| p.codec_id).collect();
        prop_assert_eq!(got, expected_tail.to_vec());

        prop_assert!(ring.is_empty());
    }
}
