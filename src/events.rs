//! FaultEvent emission — every handled and unhandled fault becomes a
//! [`FaultEvent`], logged locally and posted to the cloud's fault-recovery
//! endpoint as an independent record (not persisted; a missed post is not
//! retried, matching the "not persisted locally" contract).

use log::{error, warn};
use serde::Serialize;

use crate::error::Error;
use crate::fault::FaultClass;

/// A single fault occurrence, carrying enough detail to reconstruct the
/// incident remotely.
#[derive(Debug, Clone, Serialize)]
pub struct FaultEvent {
    pub fault_kind: String,
    pub recovery_action: String,
    pub success: bool,
    pub retry_count: u8,
    pub detail: String,
    pub device_id: String,
    /// Milliseconds since boot; the cloud side timestamps receipt.
    pub timestamp_ms: u64,
}

impl FaultEvent {
    pub fn new(
        fault_kind: impl Into<String>,
        recovery_action: impl Into<String>,
        success: bool,
        retry_count: u8,
        detail: impl Into<String>,
        device_id: impl Into<String>,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            fault_kind: fault_kind.into(),
            recovery_action: recovery_action.into(),
            success,
            retry_count,
            detail: detail.into(),
            device_id: device_id.into(),
            timestamp_ms,
        }
    }

    /// Build a `FaultEvent` from a classified protocol/transport fault.
    pub fn from_fault_class(
        class: FaultClass,
        success: bool,
        retry_count: u8,
        device_id: &str,
        timestamp_ms: u64,
    ) -> Self {
        let recovery_action = if success { "retry-succeeded" } else { "retry-exhausted" };
        Self::new(fault_class_name(class), recovery_action, success, retry_count, format!("{class:?}"), device_id, timestamp_ms)
    }

    /// Build a `FaultEvent` from a top-level [`Error`] that has no retry
    /// history of its own (envelope failures, hash mismatches, and so on).
    pub fn from_error(error: Error, device_id: &str, timestamp_ms: u64) -> Self {
        Self::new(error_kind_name(error), "surfaced", false, 0, error.to_string(), device_id, timestamp_ms)
    }
}

fn fault_class_name(class: FaultClass) -> &'static str {
    match class {
        FaultClass::Timeout => "timeout",
        FaultClass::CrcError => "protocol-crc",
        FaultClass::TruncatedOrMalformed => "protocol-malformed",
        FaultClass::BufferOverflow => "buffer-overflow",
        FaultClass::ExceptionTransient(_) | FaultClass::ExceptionPermanent(_) => "protocol-exception",
    }
}

fn error_kind_name(error: Error) -> &'static str {
    match error {
        Error::Transport => "transport",
        Error::ProtocolCrc => "protocol-crc",
        Error::ProtocolMalformed => "protocol-malformed",
        Error::ProtocolException(_) => "protocol-exception",
        Error::Timeout => "timeout",
        Error::BufferOverflow => "buffer-overflow",
        Error::Persistence => "persistence",
        Error::CompressionFailure => "compression-failure",
        Error::EnvelopeFailure => "envelope-failure",
        Error::SignatureInvalid => "signature-invalid",
        Error::HashMismatch => "hash-mismatch",
        Error::ConfigInvalid(..) => "config-invalid",
        Error::DeadlineMiss(_) => "deadline-miss",
        Error::NetworkDown => "network-down",
        Error::CounterExhausted => "counter-exhausted",
    }
}

const POST_TIMEOUT_MS: u64 = 3_000;

/// POST a `FaultEvent` to `/fault/recovery`. Always logs locally first
/// (at `warn!` on a recovered fault, `error!` on an unrecovered one),
/// independent of whether the network emission succeeds.
pub fn emit(endpoint: &str, event: &FaultEvent) {
    if event.success {
        warn!("fault: {} recovered via {} (retries={})", event.fault_kind, event.recovery_action, event.retry_count);
    } else {
        error!("fault: {} unrecovered via {} — {}", event.fault_kind, event.recovery_action, event.detail);
    }

    let result = ureq::post(endpoint)
        .timeout(std::time::Duration::from_millis(POST_TIMEOUT_MS))
        .send_json(event);
    if let Err(e) = result {
        warn!("fault: POST {endpoint} failed: {e} (event dropped, not persisted)");
    }
}
