//! Fuzz target: `envelope::open`
//!
//! Generates arbitrary `(counter, payload, mac)` inputs against a fixed HMAC
//! key and verifies that the Security Envelope's open path never panics,
//! that a genuinely sealed record always opens when its counter is fresh,
//! and that an attacker-forged MAC is accepted only on the (vanishingly
//! unlikely) occasion it happens to collide with the real one.
//!
//! cargo fuzz run fuzz_envelope_open

#![no_main]

use ecowatt::envelope::{self, EnvelopeKeys, EnvelopeRecord};
use libfuzzer_sys::fuzz_target;

const HMAC_KEY: &[u8] = b"fuzz-target-fixed-hmac-key";

fuzz_target!(|data: &[u8]| {
    if data.len() < 5 {
        return;
    }

    let (counter_bytes, rest) = data.split_at(4);
    // Never 0: `last_seen = counter - 1` below needs a non-wrapping value.
    let counter = u32::from_le_bytes(counter_bytes.try_into().unwrap()).saturating_add(1);

    let mid = rest.len() / 2;
    let payload = &rest[..mid];
    let forged_mac = &rest[mid..];

    let keys = EnvelopeKeys { hmac_key: HMAC_KEY.to_vec(), aes_key: None };
    let sealed = envelope::seal(counter, payload, &keys);

    // A freshly sealed record must always open against a lower last-seen
    // counter, recovering the exact payload.
    let opened = envelope::open(&sealed, &keys, counter - 1);
    assert_eq!(opened.as_deref(), Ok(payload));

    // The same record replayed against its own counter must be rejected.
    assert!(envelope::open(&sealed, &keys, counter).is_err());

    // Swapping in an attacker-controlled MAC must never panic, and must
    // only succeed on a genuine (astronomically unlikely) HMAC collision.
    let forged = EnvelopeRecord { mac_hex: hex::encode(forged_mac), ..sealed.clone() };
    if let Ok(recovered) = envelope::open(&forged, &keys, counter - 1) {
        assert_eq!(recovered, payload);
    }
});
