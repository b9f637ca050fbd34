//! Fault Recovery — taxonomy, retry policy, and exponential backoff.
//!
//! Classifies every transport/protocol failure into a [`FaultClass`], looks
//! up its retry budget and recoverability from a fixed table, and computes
//! the backoff delay for the next attempt. Mirrors the reconnect state
//! machine in [`crate::adapters::wifi`] (exponential backoff, capped) but
//! generalized to the register protocol's richer fault taxonomy.

use core::time::Duration;

use crate::protocol::ValidationOutcome;

/// Standard Modbus exception codes this device's inverter can return.
pub mod exception_code {
    pub const ILLEGAL_FUNCTION: u8 = 0x01;
    pub const ILLEGAL_ADDRESS: u8 = 0x02;
    pub const ILLEGAL_VALUE: u8 = 0x03;
    pub const DEVICE_FAILURE: u8 = 0x04;
    pub const ACKNOWLEDGE: u8 = 0x05;
    pub const BUSY: u8 = 0x06;
    pub const MEMORY_ERROR: u8 = 0x08;
    pub const GATEWAY_UNAVAILABLE: u8 = 0x0A;
    pub const GATEWAY_FAILED: u8 = 0x0B;
}

/// A classified fault, independent of the exact exception code for
/// exceptions sharing a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Timeout,
    CrcError,
    TruncatedOrMalformed,
    BufferOverflow,
    ExceptionTransient(u8),
    ExceptionPermanent(u8),
}

/// Retry budget and recoverability for a fault class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u8,
    pub recoverable: bool,
}

impl FaultClass {
    /// Classify a validated response outcome.
    pub fn from_validation(outcome: ValidationOutcome) -> Option<Self> {
        match outcome {
            ValidationOutcome::Ok => None,
            ValidationOutcome::CrcError => Some(Self::CrcError),
            ValidationOutcome::Truncated | ValidationOutcome::Malformed => {
                Some(Self::TruncatedOrMalformed)
            }
            ValidationOutcome::Exception(code) => Some(Self::from_exception_code(code)),
        }
    }

    fn from_exception_code(code: u8) -> Self {
        use exception_code::*;
        match code {
            ACKNOWLEDGE | BUSY => Self::ExceptionTransient(code),
            DEVICE_FAILURE | MEMORY_ERROR | GATEWAY_UNAVAILABLE | GATEWAY_FAILED => {
                Self::ExceptionTransient(code)
            }
            ILLEGAL_FUNCTION | ILLEGAL_ADDRESS | ILLEGAL_VALUE => Self::ExceptionPermanent(code),
            other => Self::ExceptionPermanent(other),
        }
    }

    /// Retry budget and recoverability for this fault class.
    pub fn policy(self) -> RetryPolicy {
        match self {
            Self::Timeout | Self::CrcError | Self::TruncatedOrMalformed => RetryPolicy {
                max_retries: 3,
                recoverable: true,
            },
            Self::BufferOverflow => RetryPolicy {
                max_retries: 0,
                recoverable: false,
            },
            Self::ExceptionTransient(_) => RetryPolicy {
                max_retries: 2,
                recoverable: true,
            },
            Self::ExceptionPermanent(_) => RetryPolicy {
                max_retries: 0,
                recoverable: false,
            },
        }
    }
}

/// Exponential backoff with a hard cap, `base * 2^attempt`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (0-indexed: the delay before the
    /// *first* retry is `attempt == 0`).
    pub fn delay_for(self, attempt: u8) -> Duration {
        let shift = attempt.min(20); // guard against absurd shift amounts
        let scaled = self.base.saturating_mul(1u32 << shift);
        scaled.min(self.max)
    }
}

/// Drives a single logical exchange through its retry budget, classifying
/// each failure and deciding whether another attempt is warranted.
pub struct RetryDriver {
    fault: FaultClass,
    attempts_made: u8,
    backoff: Backoff,
}

impl RetryDriver {
    pub fn new(fault: FaultClass, backoff: Backoff) -> Self {
        Self {
            fault,
            attempts_made: 0,
            backoff,
        }
    }

    /// Whether another attempt is permitted under this fault's policy.
    pub fn should_retry(&self) -> bool {
        self.fault.policy().recoverable && self.attempts_made < self.fault.policy().max_retries
    }

    /// Record that an attempt was made and return the delay before the next
    /// one, if [`should_retry`](Self::should_retry) is (or was) `true`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.backoff.delay_for(self.attempts_made);
        self.attempts_made += 1;
        delay
    }

    pub fn attempts_made(&self) -> u8 {
        self.attempts_made
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_error_allows_three_retries() {
        let policy = FaultClass::CrcError.policy();
        assert_eq!(policy.max_retries, 3);
        assert!(policy.recoverable);
    }

    #[test]
    fn buffer_overflow_is_non_recoverable() {
        let policy = FaultClass::BufferOverflow.policy();
        assert_eq!(policy.max_retries, 0);
        assert!(!policy.recoverable);
    }

    #[test]
    fn illegal_function_is_non_recoverable() {
        let class = FaultClass::from_exception_code(exception_code::ILLEGAL_FUNCTION);
        assert_eq!(class, FaultClass::ExceptionPermanent(exception_code::ILLEGAL_FUNCTION));
        assert!(!class.policy().recoverable);
    }

    #[test]
    fn busy_exception_allows_two_retries() {
        let class = FaultClass::from_exception_code(exception_code::BUSY);
        assert_eq!(class.policy().max_retries, 2);
        assert!(class.policy().recoverable);
    }

    #[test]
    fn gateway_failed_allows_two_retries() {
        let class = FaultClass::from_exception_code(exception_code::GATEWAY_FAILED);
        assert_eq!(class.policy().max_retries, 2);
    }

    #[test]
    fn from_validation_maps_ok_to_none() {
        assert_eq!(FaultClass::from_validation(ValidationOutcome::Ok), None);
    }

    #[test]
    fn from_validation_maps_truncated_and_malformed_identically() {
        assert_eq!(
            FaultClass::from_validation(ValidationOutcome::Truncated),
            FaultClass::from_validation(ValidationOutcome::Malformed)
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(b.delay_for(0), Duration::from_secs(1));
        assert_eq!(b.delay_for(1), Duration::from_secs(2));
        assert_eq!(b.delay_for(2), Duration::from_secs(4));
        assert_eq!(b.delay_for(10), Duration::from_secs(10)); // capped
    }

    #[test]
    fn retry_driver_exhausts_budget() {
        let mut driver = RetryDriver::new(
            FaultClass::CrcError,
            Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
        );
        assert!(driver.should_retry());
        driver.next_delay();
        assert!(driver.should_retry());
        driver.next_delay();
        assert!(driver.should_retry());
        driver.next_delay();
        assert!(!driver.should_retry());
        assert_eq!(driver.attempts_made(), 3);
    }

    #[test]
    fn retry_driver_never_retries_non_recoverable() {
        let driver = RetryDriver::new(
            FaultClass::BufferOverflow,
            Backoff::new(Duration::from_millis(100), Duration::from_secs(5)),
        );
        assert!(!driver.should_retry());
    }
}
