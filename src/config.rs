//! Device configuration.
//!
//! All tunable parameters for the EcoWatt telemetry firmware. Values can be
//! overridden by the Configuration Reconciler after a cloud-side fetch; see
//! [`crate::reconciler`].

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Bitmask of enabled power-saving techniques (low 4 bits used).
pub type PowerTechniquesMask = u8;

/// Device-wide configuration, persisted under the `config/*` namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Register-poll period, in milliseconds.
    pub poll_period_ms: u32,
    /// Telemetry upload period, in milliseconds. Must be >= `poll_period_ms`.
    pub upload_period_ms: u32,
    /// How often the device checks for a new desired configuration.
    pub config_poll_period_ms: u32,
    /// How often the device polls for pending commands.
    pub command_poll_period_ms: u32,
    /// How often the device checks for a firmware update.
    pub firmware_check_period_ms: u32,
    /// How often the device reports accumulated energy.
    pub energy_report_period_ms: u32,
    /// Register addresses to poll each cycle; must be a subset of the
    /// device's register catalog and between 3 and 10 entries.
    pub registers: Vec<u16>,
    /// Enabled power-saving techniques.
    pub power_techniques: PowerTechniquesMask,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            poll_period_ms: 5_000,
            upload_period_ms: 60_000,
            config_poll_period_ms: 30_000,
            command_poll_period_ms: 15_000,
            firmware_check_period_ms: 3_600_000,
            energy_report_period_ms: 300_000,
            registers: vec![0x0000, 0x0001, 0x0002],
            power_techniques: 0,
        }
    }
}

/// Inclusive millisecond bounds for a configuration field.
struct Range {
    min: u32,
    max: u32,
}

const POLL_PERIOD: Range = Range {
    min: 1_000,
    max: 3_600_000,
};
const CONFIG_POLL_PERIOD: Range = Range {
    min: 1_000,
    max: 300_000,
};
const COMMAND_POLL_PERIOD: Range = Range {
    min: 5_000,
    max: 300_000,
};
const FIRMWARE_CHECK_PERIOD: Range = Range {
    min: 30_000,
    max: 86_400_000,
};
const ENERGY_REPORT_PERIOD: Range = Range {
    min: 60_000,
    max: 3_600_000,
};
const UPLOAD_PERIOD_MIN_MS: u32 = 10_000;
const UPLOAD_PERIOD_MAX_MS: u32 = 3_600_000;
const REGISTER_COUNT_MIN: usize = 3;
const REGISTER_COUNT_MAX: usize = 10;
/// Only the low 4 bits of the power-techniques mask carry meaning.
const POWER_TECHNIQUES_MASK_BITS: u8 = 0b1111;

impl DeviceConfig {
    /// Validate every field against the device's configuration range table.
    ///
    /// Returns the first violation found. Callers that need every violation
    /// (e.g. the reconciler's per-key ack) should use [`Self::validate_all`].
    pub fn validate(&self) -> Result<(), Error> {
        self.validate_all().into_iter().next().map_or(Ok(()), Err)
    }

    /// Validate every field, returning all violations found (possibly empty).
    pub fn validate_all(&self) -> Vec<Error> {
        let mut errors = Vec::new();

        if !in_range_ms(self.poll_period_ms, &POLL_PERIOD) {
            errors.push(Error::ConfigInvalid(
                "poll-period",
                "must be between 1s and 1h",
            ));
        }
        if self.upload_period_ms < UPLOAD_PERIOD_MIN_MS
            || self.upload_period_ms > UPLOAD_PERIOD_MAX_MS
        {
            errors.push(Error::ConfigInvalid(
                "upload-period",
                "must be between 10s and 1h",
            ));
        } else if self.upload_period_ms < self.poll_period_ms {
            errors.push(Error::ConfigInvalid(
                "upload-period",
                "must be >= poll-period",
            ));
        }
        if !in_range_ms(self.config_poll_period_ms, &CONFIG_POLL_PERIOD) {
            errors.push(Error::ConfigInvalid(
                "config-poll-period",
                "must be between 1s and 5min",
            ));
        }
        if !in_range_ms(self.command_poll_period_ms, &COMMAND_POLL_PERIOD) {
            errors.push(Error::ConfigInvalid(
                "command-poll-period",
                "must be between 5s and 5min",
            ));
        }
        if !in_range_ms(self.firmware_check_period_ms, &FIRMWARE_CHECK_PERIOD) {
            errors.push(Error::ConfigInvalid(
                "firmware-check-period",
                "must be between 30s and 24h",
            ));
        }
        if !in_range_ms(self.energy_report_period_ms, &ENERGY_REPORT_PERIOD) {
            errors.push(Error::ConfigInvalid(
                "energy-report-period",
                "must be between 60s and 1h",
            ));
        }
        if self.registers.len() < REGISTER_COUNT_MIN || self.registers.len() > REGISTER_COUNT_MAX
        {
            errors.push(Error::ConfigInvalid(
                "register-count",
                "must select between 3 and 10 registers",
            ));
        }
        if self.power_techniques & !POWER_TECHNIQUES_MASK_BITS != 0 {
            errors.push(Error::ConfigInvalid(
                "power-techniques-bitmask",
                "only the low 4 bits are assigned",
            ));
        }

        errors
    }

    /// Whether `registers` is a subset of the device's register catalog.
    pub fn registers_subset_of(&self, catalog: &[u16]) -> bool {
        self.registers.iter().all(|r| catalog.contains(r))
    }
}

fn in_range_ms(value: u32, range: &Range) -> bool {
    (range.min..=range.max).contains(&value)
}
