//! Persistent Store — namespaced key/value storage backing configuration,
//! the security counter, firmware update state, power-management
//! accumulators, and diagnostic counters.
//!
//! [`PersistentStorePort`] is deliberately small (four byte-oriented
//! primitives); everything else is a default method built on top, mirroring
//! how [`crate::adapters::nvs`]'s old `StoragePort` exposed raw
//! `read`/`write`/`delete`/`exists` and left structured access to callers.
//! Write serialization across tasks is the caller's responsibility — see
//! the store mutex held by [`crate::supervisor`] — this trait assumes a
//! single writer at a time but permits concurrent readers.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// Storage namespaces. Each subsystem owns exactly one.
pub mod namespace {
    pub const CONFIG: &str = "config";
    pub const SECURITY: &str = "security";
    pub const FIRMWARE: &str = "firmware";
    pub const POWER: &str = "power";
    pub const DIAGNOSTICS: &str = "diagnostics";
}

/// Well-known keys within the namespaces above.
pub mod key {
    pub const DEVICE_CONFIG: &str = "device";
    pub const SECURITY_COUNTER: &str = "counter";
    pub const SECURITY_HMAC_KEY: &str = "hmac-key";
    pub const SECURITY_AES_KEY: &str = "aes-key";
    pub const SECURITY_LAST_SEEN_COUNTER: &str = "last-seen-counter";
    pub const FIRMWARE_ACTIVE_SLOT: &str = "active-slot";
    pub const FIRMWARE_PENDING_MANIFEST: &str = "pending-manifest";
    pub const FIRMWARE_UPDATE_KEY: &str = "update-key";
    pub const FIRMWARE_SIGNING_KEY: &str = "signing-key";
    pub const FIRMWARE_STATE: &str = "state";
    pub const FIRMWARE_CHUNKS_RECEIVED: &str = "chunks-received";
    pub const POWER_ENERGY_ACCUMULATOR_WH: &str = "energy-wh";
    pub const DIAGNOSTICS_COUNTERS: &str = "counters";
    pub const WIFI_SSID: &str = "wifi-ssid";
    pub const WIFI_PASSWORD: &str = "wifi-password";
}

/// Largest value this store will round-trip through the typed helpers.
/// Device configs, firmware manifests, and diagnostic counters all fit
/// comfortably under this; a value larger than it is a programmer error,
/// not a runtime condition to recover from gracefully.
pub const MAX_VALUE_SIZE: usize = 4096;

/// Port a persistence backend (NVS on hardware, an in-memory map in
/// simulation) must implement.
pub trait PersistentStorePort {
    /// Read raw bytes into `buf`, returning the number of bytes written.
    /// `Err(Error::Persistence)` if `key` doesn't exist under `namespace`.
    fn read_bytes(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, Error>;

    /// Overwrite (or create) `key` under `namespace` with `data`.
    fn write_bytes(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), Error>;

    /// Remove `key` from `namespace`. Not an error if it didn't exist.
    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), Error>;

    fn exists(&self, namespace: &str, key: &str) -> bool;

    /// Read and deserialize a JSON value, or `None` if the key is absent,
    /// oversized, or malformed.
    fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        let mut buf = vec![0u8; MAX_VALUE_SIZE];
        let len = self.read_bytes(namespace, key, &mut buf).ok()?;
        serde_json::from_slice(&buf[..len]).ok()
    }

    /// Serialize and write a JSON value.
    fn put_json<T: Serialize>(&mut self, namespace: &str, key: &str, value: &T) -> Result<(), Error> {
        let bytes = serde_json::to_vec(value).map_err(|_| Error::Persistence)?;
        self.write_bytes(namespace, key, &bytes)
    }

    /// Read a little-endian `u32`, e.g. the security counter.
    fn get_u32(&self, namespace: &str, key: &str) -> Option<u32> {
        let mut buf = [0u8; 4];
        let len = self.read_bytes(namespace, key, &mut buf).ok()?;
        (len == 4).then(|| u32::from_le_bytes(buf))
    }

    fn put_u32(&mut self, namespace: &str, key: &str, value: u32) -> Result<(), Error> {
        self.write_bytes(namespace, key, &value.to_le_bytes())
    }
}
