//! Diagnostic counters — out-of-range register reads, ring-buffer drops,
//! compression failures, and deadline misses, tracked across reboots so a
//! slow-building systemic problem is visible even after a power cycle.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::store::{key, namespace, PersistentStorePort};

/// Diagnostic counters, persisted as a single JSON blob under
/// `diagnostics/counters`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticCounters {
    /// A polled register's decoded value fell outside its semantic type's
    /// plausible range (see [`crate::compression::RegisterType`]).
    pub out_of_range_reads: u32,
    /// A `CompressedRing` push silently overwrote an undrained packet.
    pub ring_drops: u32,
    /// The compression tournament produced no codec within budget, falling
    /// back to the forced raw-binary re-encode.
    pub compression_failures: u32,
    /// A task missed its per-tick deadline (mirrors
    /// [`crate::deadline::DeadlineMonitor::lifetime_misses`], tracked here
    /// too so it survives in the same snapshot as the other counters).
    pub deadline_misses: u32,
}

pub struct DiagnosticsTracker {
    counters: DiagnosticCounters,
}

impl DiagnosticsTracker {
    /// Load the persisted counters (all zero on first boot).
    pub fn load<S: PersistentStorePort>(store: &S) -> Self {
        let counters = store.get_json(namespace::DIAGNOSTICS, key::DIAGNOSTICS_COUNTERS).unwrap_or_default();
        Self { counters }
    }

    pub fn snapshot(&self) -> DiagnosticCounters {
        self.counters
    }

    pub fn record_out_of_range_read<S: PersistentStorePort>(&mut self, store: &mut S, register: u16, value: u16) {
        warn!("diagnostics: register {register:#06x} read out-of-range value {value}");
        self.counters.out_of_range_reads += 1;
        self.persist(store);
    }

    pub fn record_ring_drop<S: PersistentStorePort>(&mut self, store: &mut S) {
        self.counters.ring_drops += 1;
        self.persist(store);
    }

    pub fn record_compression_failure<S: PersistentStorePort>(&mut self, store: &mut S) {
        warn!("diagnostics: compression tournament fell back to raw binary");
        self.counters.compression_failures += 1;
        self.persist(store);
    }

    pub fn record_deadline_miss<S: PersistentStorePort>(&mut self, store: &mut S) {
        self.counters.deadline_misses += 1;
        self.persist(store);
    }

    fn persist<S: PersistentStorePort>(&self, store: &mut S) {
        if let Err(e) = store.put_json(namespace::DIAGNOSTICS, key::DIAGNOSTICS_COUNTERS, &self.counters) {
            warn!("diagnostics: failed to persist counters: {e}");
        }
    }
}

/// Install a panic hook that logs the failure before the platform watchdog
/// or default panic handler triggers a reset. Diagnostic counters above are
/// deliberately not touched here — a panic mid-write could leave them
/// corrupt, and the exit behavior is an unconditional reboot regardless.
pub fn install_panic_hook(device_id: String) {
    std::panic::set_hook(Box::new(move |info| {
        let reason = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic".to_string()
        };
        log::error!("PANIC on {device_id}: {reason}");
    }));
}
