//! Security counter persistence across a simulated reboot.
//!
//! The host-side [`ecowatt::adapters::nvs::NvsAdapter`] backend is an
//! in-memory map that doesn't survive being dropped, so a "reboot" here is
//! simulated by copying the counter's raw bytes from one adapter instance
//! into a fresh one — exactly what flash-backed NVS would do for free.

use ecowatt::adapters::nvs::NvsAdapter;
use ecowatt::envelope::{self, EnvelopeKeys};
use ecowatt::store::{key, namespace, PersistentStorePort};

fn transplant_counter(from: &NvsAdapter, to: &mut NvsAdapter) {
    let mut buf = [0u8; 4];
    let len = from.read_bytes(namespace::SECURITY, key::SECURITY_COUNTER, &mut buf).unwrap();
    to.write_bytes(namespace::SECURITY, key::SECURITY_COUNTER, &buf[..len]).unwrap();
}

#[test]
fn counter_survives_a_simulated_reboot_and_keeps_increasing() {
    let mut boot_one = NvsAdapter::new().unwrap();
    let first = envelope::next_counter(&mut boot_one).unwrap();
    let second = envelope::next_counter(&mut boot_one).unwrap();
    assert_eq!(second, first + 1);

    let mut boot_two = NvsAdapter::new().unwrap();
    transplant_counter(&boot_one, &mut boot_two);

    let third = envelope::next_counter(&mut boot_two).unwrap();
    assert_eq!(third, second + 1, "counter must keep increasing across the simulated reboot");
}

#[test]
fn a_reused_counter_is_rejected_as_a_replay() {
    let mut store = NvsAdapter::new().unwrap();
    let keys = EnvelopeKeys { hmac_key: b"replay-test-key".to_vec(), aes_key: None };

    let counter = envelope::next_counter(&mut store).unwrap();
    let record = envelope::seal(counter, b"telemetry-payload", &keys);

    // First delivery: counter is fresh, opens cleanly.
    assert!(envelope::open(&record, &keys, counter - 1).is_ok());
    // Replaying the exact same record against a last-seen counter that has
    // already advanced past it must be rejected.
    assert!(envelope::open(&record, &keys, counter).is_err());
}
