#![allow(dead_code)] // Variants reserved for call sites not wired into every subsystem yet

//! Unified error types for the EcoWatt firmware.
//!
//! Follows embedded best practice: a single `Error` enum that every subsystem
//! can convert into, keeping the supervisor's error handling uniform across
//! tasks. Variants are `Copy` so they can be cheaply passed through channels
//! without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The underlying serial/bus link could not be reached at all.
    Transport,
    /// A received frame failed its CRC-16 check.
    ProtocolCrc,
    /// A received frame was truncated or otherwise structurally invalid.
    ProtocolMalformed,
    /// The remote device returned a Modbus-style exception response.
    ProtocolException(u8),
    /// An operation did not complete within its deadline.
    Timeout,
    /// A fixed-capacity buffer would have overflowed.
    BufferOverflow,
    /// The persistent store failed to read or write a key.
    Persistence,
    /// No codec could produce output within budget or under the size cap.
    CompressionFailure,
    /// The security envelope could not be constructed.
    EnvelopeFailure,
    /// A firmware manifest's RSA-PSS signature did not verify.
    SignatureInvalid,
    /// A downloaded firmware image's SHA-256 hash did not match the manifest.
    HashMismatch,
    /// A configuration value was rejected by range validation.
    ConfigInvalid(&'static str, &'static str),
    /// A task missed its deadline.
    DeadlineMiss(&'static str),
    /// The network link is known to be down; the operation was not attempted.
    NetworkDown,
    /// The security envelope's replay counter reached `u32::MAX`; outbound
    /// traffic halts rather than wrap back to a reused value.
    CounterExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport error"),
            Self::ProtocolCrc => write!(f, "protocol: CRC mismatch"),
            Self::ProtocolMalformed => write!(f, "protocol: malformed frame"),
            Self::ProtocolException(code) => write!(f, "protocol: exception code {code}"),
            Self::Timeout => write!(f, "timeout"),
            Self::BufferOverflow => write!(f, "buffer overflow"),
            Self::Persistence => write!(f, "persistence error"),
            Self::CompressionFailure => write!(f, "compression failure"),
            Self::EnvelopeFailure => write!(f, "envelope failure"),
            Self::SignatureInvalid => write!(f, "firmware signature invalid"),
            Self::HashMismatch => write!(f, "firmware hash mismatch"),
            Self::ConfigInvalid(key, reason) => write!(f, "config '{key}' invalid: {reason}"),
            Self::DeadlineMiss(task) => write!(f, "deadline missed: {task}"),
            Self::NetworkDown => write!(f, "network down"),
            Self::CounterExhausted => write!(f, "security counter exhausted"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Fault taxonomy (protocol-level exceptions and transport faults)
// ---------------------------------------------------------------------------

/// Classification used by the fault-recovery layer to decide retry policy.
/// See [`crate::fault`] for the taxonomy table this maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    Crc,
    TruncatedOrMalformed,
    BufferOverflow,
    Exception(u8),
}

impl From<Error> for Option<FaultKind> {
    fn from(e: Error) -> Self {
        match e {
            Error::Timeout => Some(FaultKind::Timeout),
            Error::ProtocolCrc => Some(FaultKind::Crc),
            Error::ProtocolMalformed => Some(FaultKind::TruncatedOrMalformed),
            Error::BufferOverflow => Some(FaultKind::BufferOverflow),
            Error::ProtocolException(code) => Some(FaultKind::Exception(code)),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
