//! Configuration Reconciler — fetches the cloud's desired [`DeviceConfig`],
//! diffs it against the persisted copy, range-validates every changed
//! field, and applies the change atomically (fully, or not at all).

use log::{info, warn};
use serde::Serialize;

use crate::config::DeviceConfig;
use crate::error::Error;
use crate::store::{key, namespace, PersistentStorePort};

const FETCH_TIMEOUT_MS: u64 = 2_000;

/// One field-level difference between the persisted and desired config,
/// surfaced for the per-key acknowledgement the cloud side expects.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    pub key: &'static str,
    pub accepted: bool,
    pub reason: Option<&'static str>,
}

/// Outcome of one reconciliation tick, ready to POST to the ack endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileAck {
    pub applied: bool,
    pub diffs: Vec<AckEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckEntry {
    pub key: String,
    pub accepted: bool,
    pub reason: Option<String>,
}

/// Register catalog the device can legally poll — used to validate the
/// reconciler's `registers` field the same way the polling pipeline does.
pub fn reconcile<S: PersistentStorePort>(
    store: &mut S,
    desired: DeviceConfig,
    register_catalog: &[u16],
) -> ReconcileAck {
    let current = store
        .get_json::<DeviceConfig>(namespace::CONFIG, key::DEVICE_CONFIG)
        .unwrap_or_default();

    if current == desired {
        return ReconcileAck { applied: true, diffs: Vec::new() };
    }

    let diffs = diff_fields(&current, &desired);
    let mut violations = desired.validate_all();
    if !desired.registers_subset_of(register_catalog) {
        violations.push(Error::ConfigInvalid(
            "register-selection",
            "not a subset of the device's register catalog",
        ));
    }

    if violations.is_empty() {
        match store.put_json(namespace::CONFIG, key::DEVICE_CONFIG, &desired) {
            Ok(()) => {
                info!("reconciler: applied {} changed field(s)", diffs.len());
                ack_from_diffs(true, &diffs, &[])
            }
            Err(e) => {
                warn!("reconciler: persisting desired config failed: {e}");
                ack_from_diffs(false, &diffs, &[Error::ConfigInvalid("persistence", "write failed")])
            }
        }
    } else {
        warn!("reconciler: rejected desired config, {} violation(s)", violations.len());
        ack_from_diffs(false, &diffs, &violations)
    }
}

fn diff_fields(current: &DeviceConfig, desired: &DeviceConfig) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if current.poll_period_ms != desired.poll_period_ms {
        changed.push("poll-period");
    }
    if current.upload_period_ms != desired.upload_period_ms {
        changed.push("upload-period");
    }
    if current.config_poll_period_ms != desired.config_poll_period_ms {
        changed.push("config-poll-period");
    }
    if current.command_poll_period_ms != desired.command_poll_period_ms {
        changed.push("command-poll-period");
    }
    if current.firmware_check_period_ms != desired.firmware_check_period_ms {
        changed.push("firmware-check-period");
    }
    if current.energy_report_period_ms != desired.energy_report_period_ms {
        changed.push("energy-report-period");
    }
    if current.registers != desired.registers {
        changed.push("register-selection");
    }
    if current.power_techniques != desired.power_techniques {
        changed.push("power-techniques-bitmask");
    }
    changed
}

fn ack_from_diffs(applied: bool, changed_keys: &[&'static str], violations: &[Error]) -> ReconcileAck {
    let diffs = changed_keys
        .iter()
        .map(|&k| {
            let reason = violations.iter().find_map(|v| match v {
                Error::ConfigInvalid(vk, reason) if *vk == k => Some(reason.to_string()),
                _ => None,
            });
            AckEntry { key: k.to_string(), accepted: applied, reason }
        })
        .collect();
    ReconcileAck { applied, diffs }
}

/// Fetch the desired configuration from the cloud. A network failure is not
/// an error worth escalating — the reconciler simply tries again next tick.
pub fn fetch_desired(endpoint: &str) -> Result<DeviceConfig, Error> {
    ureq::get(endpoint)
        .timeout(std::time::Duration::from_millis(FETCH_TIMEOUT_MS))
        .call()
        .map_err(|e| {
            warn!("reconciler: GET {endpoint} failed: {e}");
            Error::NetworkDown
        })?
        .into_json()
        .map_err(|_| Error::EnvelopeFailure)
}

/// POST the reconciliation outcome back to the cloud's ack endpoint.
pub fn post_ack(endpoint: &str, ack: &ReconcileAck) -> Result<(), Error> {
    ureq::post(endpoint)
        .timeout(std::time::Duration::from_millis(FETCH_TIMEOUT_MS))
        .send_json(ack)
        .map(|_| ())
        .map_err(|e| {
            warn!("reconciler: POST {endpoint} failed: {e}");
            Error::NetworkDown
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::nvs::NvsAdapter;

    const CATALOG: [u16; 4] = [0x0000, 0x0001, 0x0002, 0x0003];

    #[test]
    fn identical_config_is_a_no_op() {
        let mut store = NvsAdapter::new().unwrap();
        let cfg = DeviceConfig::default();
        store.put_json(namespace::CONFIG, key::DEVICE_CONFIG, &cfg).unwrap();

        let ack = reconcile(&mut store, cfg, &CATALOG);
        assert!(ack.applied);
        assert!(ack.diffs.is_empty());
    }

    #[test]
    fn valid_change_is_applied_and_persisted() {
        let mut store = NvsAdapter::new().unwrap();
        store.put_json(namespace::CONFIG, key::DEVICE_CONFIG, &DeviceConfig::default()).unwrap();

        let desired = DeviceConfig { poll_period_ms: 10_000, ..DeviceConfig::default() };
        let ack = reconcile(&mut store, desired.clone(), &CATALOG);

        assert!(ack.applied);
        assert_eq!(ack.diffs.len(), 1);
        assert!(ack.diffs[0].accepted);

        let persisted: DeviceConfig = store.get_json(namespace::CONFIG, key::DEVICE_CONFIG).unwrap();
        assert_eq!(persisted.poll_period_ms, 10_000);
    }

    #[test]
    fn invalid_change_is_fully_rejected() {
        let mut store = NvsAdapter::new().unwrap();
        let original = DeviceConfig::default();
        store.put_json(namespace::CONFIG, key::DEVICE_CONFIG, &original).unwrap();

        let desired = DeviceConfig { poll_period_ms: 500, upload_period_ms: 10_000, ..DeviceConfig::default() };
        let ack = reconcile(&mut store, desired, &CATALOG);

        assert!(!ack.applied);
        let persisted: DeviceConfig = store.get_json(namespace::CONFIG, key::DEVICE_CONFIG).unwrap();
        assert_eq!(persisted, original);
    }

    #[test]
    fn registers_outside_catalog_are_rejected() {
        let mut store = NvsAdapter::new().unwrap();
        store.put_json(namespace::CONFIG, key::DEVICE_CONFIG, &DeviceConfig::default()).unwrap();

        let desired = DeviceConfig { registers: vec![0x00FF, 0x0001, 0x0002], ..DeviceConfig::default() };
        let ack = reconcile(&mut store, desired, &CATALOG);
        assert!(!ack.applied);
    }
}
