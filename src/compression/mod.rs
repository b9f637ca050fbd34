//! Adaptive Compression Engine.
//!
//! Four purpose-built codecs (Dictionary, Temporal Delta, Semantic RLE,
//! Bit-Packed) and three raw/delta/RLE fallbacks compete in a [`tournament`]
//! each time a batch is ready to compress; the engine tracks a rolling
//! record of each codec's performance so future characterization can prefer
//! likely winners. Grounded on [`crate::rpc::compress`]'s size-threshold,
//! `Option`-returning compression API, generalized to a multi-codec contest.

pub mod bitpack;
pub mod characterize;
pub mod dictionary;
pub mod fallback;
pub mod semantic_rle;
pub mod stats;
pub mod temporal_delta;
pub mod tournament;

use crate::batch::Sample;

/// Codec identifier byte — the first byte of every compressed packet.
pub mod codec_id {
    pub const RAW_BINARY: u8 = 0x00;
    pub const BIT_PACKED: u8 = 0x01;
    pub const BINARY_DELTA: u8 = 0x02;
    pub const BINARY_RLE: u8 = 0x03;
    pub const SEMANTIC_RLE: u8 = 0x50;
    pub const TEMPORAL_DELTA: u8 = 0x71;
    pub const DICTIONARY: u8 = 0xD0;
}

/// Hard cap on a compressed packet's total size (codec id byte included).
pub const MAX_PACKET_SIZE: usize = 512;

/// Register physical type, used by [`semantic_rle`] to pick a lossy-match
/// tolerance. Register raw units follow a fixed convention this firmware
/// assumes throughout: voltage in volts, current in deci-amps (0.1 A),
/// temperature in deci-degrees-Celsius (0.1 degC), power in watts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    Voltage,
    Current,
    Frequency,
    Temperature,
    Power,
    PowerSetpoint,
    Other,
}

impl RegisterType {
    /// Acceptable raw-unit deviation for a lossy semantic match.
    pub fn tolerance_raw(self) -> u16 {
        match self {
            Self::Voltage => 2,
            Self::Current => 1,
            Self::Frequency => 1,
            Self::Temperature => 5,
            Self::Power => 1,
            Self::PowerSetpoint => 1,
            Self::Other => 0,
        }
    }
}

/// Encode the shared packet header every codec body starts with: a sample
/// count (u16 LE) followed by each sample's register address (u16 LE), in
/// batch order. Per-value payload follows immediately after, codec-specific.
/// Timestamps are never carried across compression — [`Codec::round_trip_ok`]
/// does not check them, and the uploader re-stamps on receipt.
pub fn encode_header(samples: &[Sample]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + samples.len() * 2);
    out.extend_from_slice(&(samples.len() as u16).to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.register.to_le_bytes());
    }
    out
}

/// Decode the header written by [`encode_header`], returning the register
/// list and the remaining codec-specific payload slice.
pub fn decode_header(body: &[u8]) -> Option<(Vec<u16>, &[u8])> {
    if body.len() < 2 {
        return None;
    }
    let count = u16::from_le_bytes([body[0], body[1]]) as usize;
    let registers_end = 2 + count * 2;
    if body.len() < registers_end {
        return None;
    }
    let registers = body[2..registers_end]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Some((registers, &body[registers_end..]))
}

/// A codec the tournament can run. Each codec owns its encode/decode pair
/// and its own correctness criterion for the round-trip self-check.
pub trait Codec {
    fn id(&self) -> u8;
    fn name(&self) -> &'static str;

    /// Encode `samples` into a codec-specific byte body (not including the
    /// leading codec-id byte; [`tournament::run`] prepends that).
    fn encode(&self, samples: &[Sample]) -> Option<Vec<u8>>;

    /// Decode a codec body back into samples, given the register type
    /// expected for each position (only consulted by lossy codecs).
    fn decode(&self, body: &[u8], register_types: &[RegisterType]) -> Option<Vec<Sample>>;

    /// Whether `decoded` is an acceptable reconstruction of `original` for
    /// this codec's own correctness criterion (exact for lossless codecs,
    /// tolerance-based for semantic RLE).
    fn round_trip_ok(&self, original: &[Sample], decoded: &[Sample], register_types: &[RegisterType]) -> bool {
        let _ = register_types;
        original.len() == decoded.len()
            && original
                .iter()
                .zip(decoded.iter())
                .all(|(a, b)| a.register == b.register && a.value == b.value)
    }
}
