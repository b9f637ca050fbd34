//! Power management — accumulates energy readings between report ticks and
//! applies the configured power-saving techniques to the rest of the
//! firmware's scheduling.
//!
//! The techniques bitmask (low 4 bits of [`crate::config::DeviceConfig::power_techniques`])
//! doesn't gate a separate subsystem; it's read by the Task Supervisor and
//! Polling Pipeline to decide how aggressively to back off between ticks.
//! This module owns the bit definitions and the energy accumulator alone.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::PowerTechniquesMask;
use crate::error::Error;
use crate::store::{key, namespace, PersistentStorePort};

/// Halve the effective poll rate whenever the link is otherwise idle.
pub const TECHNIQUE_REDUCED_POLL_RATE: PowerTechniquesMask = 0b0001;
/// Enter ESP-IDF light sleep between polls instead of busy-waiting.
pub const TECHNIQUE_LIGHT_SLEEP_BETWEEN_POLLS: PowerTechniquesMask = 0b0010;
/// Power down the Wi-Fi radio between upload ticks instead of staying
/// associated.
pub const TECHNIQUE_WIFI_MODEM_SLEEP: PowerTechniquesMask = 0b0100;
/// Scale the CPU frequency down outside of active compression/upload work.
pub const TECHNIQUE_CPU_FREQ_SCALING: PowerTechniquesMask = 0b1000;

/// Energy totals tracked between report ticks, persisted so a reboot
/// doesn't lose partial accumulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyAccumulator {
    pub accumulated_wh: f64,
}

/// Running counters exposed to `get_power_stats`/`reset_power_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PowerStats {
    pub reports_sent: u32,
    pub reports_failed: u32,
}

pub struct PowerManager {
    accumulator: EnergyAccumulator,
    stats: PowerStats,
}

impl PowerManager {
    /// Load the persisted accumulator (zero on first boot).
    pub fn load<S: PersistentStorePort>(store: &S) -> Self {
        let accumulator = store
            .get_json(namespace::POWER, key::POWER_ENERGY_ACCUMULATOR_WH)
            .unwrap_or_default();
        Self { accumulator, stats: PowerStats::default() }
    }

    pub fn stats(&self) -> PowerStats {
        self.stats
    }

    pub fn accumulated_wh(&self) -> f64 {
        self.accumulator.accumulated_wh
    }

    /// Add one reading: `power_watts` held for `elapsed_ms`, converted to
    /// watt-hours and persisted immediately (the accumulator is small and
    /// cheap to write every tick; losing a partial interval on crash is
    /// preferable to losing the whole accumulator).
    pub fn accumulate<S: PersistentStorePort>(
        &mut self,
        store: &mut S,
        power_watts: f64,
        elapsed_ms: u32,
    ) -> Result<(), Error> {
        self.accumulator.accumulated_wh += power_watts * (elapsed_ms as f64 / 3_600_000.0);
        store.put_json(namespace::POWER, key::POWER_ENERGY_ACCUMULATOR_WH, &self.accumulator)
    }

    /// Reset the accumulator to zero after a successful report, so the next
    /// interval starts clean.
    fn reset_accumulator<S: PersistentStorePort>(&mut self, store: &mut S) -> Result<(), Error> {
        self.accumulator = EnergyAccumulator::default();
        store.put_json(namespace::POWER, key::POWER_ENERGY_ACCUMULATOR_WH, &self.accumulator)
    }

    /// POST the accumulated energy to `/power/energy/{device-id}` and reset
    /// the accumulator on success. A failed report leaves the accumulator
    /// intact so the next tick reports the combined total instead of
    /// silently losing readings.
    pub fn report<S: PersistentStorePort>(&mut self, store: &mut S, endpoint: &str) -> Result<(), Error> {
        let body = EnergyReport { accumulated_wh: self.accumulator.accumulated_wh };
        let result = ureq::post(endpoint)
            .timeout(std::time::Duration::from_secs(5))
            .send_json(&body);

        match result {
            Ok(_) => {
                self.stats.reports_sent += 1;
                info!("power: reported {:.3} Wh to {endpoint}", body.accumulated_wh);
                self.reset_accumulator(store)
            }
            Err(e) => {
                self.stats.reports_failed += 1;
                warn!("power: energy report to {endpoint} failed: {e}");
                Err(Error::NetworkDown)
            }
        }
    }

    pub fn reset_stats(&mut self) {
        self.stats = PowerStats::default();
    }
}

#[derive(Serialize)]
struct EnergyReport {
    accumulated_wh: f64,
}

/// Multiply a base period by this factor when [`TECHNIQUE_REDUCED_POLL_RATE`]
/// is enabled.
pub fn effective_poll_period_ms(techniques: PowerTechniquesMask, base_period_ms: u32) -> u32 {
    if techniques & TECHNIQUE_REDUCED_POLL_RATE != 0 {
        base_period_ms.saturating_mul(2)
    } else {
        base_period_ms
    }
}

pub fn light_sleep_enabled(techniques: PowerTechniquesMask) -> bool {
    techniques & TECHNIQUE_LIGHT_SLEEP_BETWEEN_POLLS != 0
}

pub fn wifi_modem_sleep_enabled(techniques: PowerTechniquesMask) -> bool {
    techniques & TECHNIQUE_WIFI_MODEM_SLEEP != 0
}

pub fn cpu_freq_scaling_enabled(techniques: PowerTechniquesMask) -> bool {
    techniques & TECHNIQUE_CPU_FREQ_SCALING != 0
}
