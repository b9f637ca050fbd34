//! Fuzz target: `PersistentStorePort` byte round trip (host NVS backend)
//!
//! Writes arbitrary bytes under an arbitrary namespace/key pair and checks
//! they read back unchanged, that `exists`/`delete` never panic, and that a
//! too-small read buffer truncates rather than overflowing.
//!
//! cargo fuzz run fuzz_nvs_roundtrip

#![no_main]

use ecowatt::adapters::nvs::NvsAdapter;
use ecowatt::store::PersistentStorePort;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }

    let ns_len = (data[0] as usize % 16) + 1;
    let key_len = (data[1] as usize % 16) + 1;
    if data.len() < 2 + ns_len + key_len {
        return;
    }
    let namespace = String::from_utf8_lossy(&data[2..2 + ns_len]);
    let key = String::from_utf8_lossy(&data[2 + ns_len..2 + ns_len + key_len]);
    let payload = &data[2 + ns_len + key_len..];

    let mut store = NvsAdapter::new().unwrap();
    assert!(!store.exists(&namespace, &key));

    store.write_bytes(&namespace, &key, payload).unwrap();
    assert!(store.exists(&namespace, &key));

    let mut buf = vec![0u8; payload.len()];
    let len = store.read_bytes(&namespace, &key, &mut buf).unwrap();
    assert_eq!(&buf[..len], payload);

    // A read buffer shorter than the stored value truncates, never panics.
    let mut short_buf = [0u8; 4];
    if let Ok(short_len) = store.read_bytes(&namespace, &key, &mut short_buf) {
        assert!(short_len <= short_buf.len());
        assert_eq!(&short_buf[..short_len], &payload[..short_len]);
    }

    store.delete(&namespace, &key).unwrap();
    assert!(!store.exists(&namespace, &key));
});
