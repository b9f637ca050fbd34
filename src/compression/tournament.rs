//! The tournament — runs every codec against the current batch and keeps
//! the smallest lossless result. No codec is skipped based on history or
//! characterization; characterization is diagnostic only (see
//! [`super::characterize`]), and every codec gets a fair run each time.
//! Mirrors [`crate::rpc::compress`]'s "try, verify, keep if smaller"
//! single-codec shape, generalized to a multi-codec contest with time
//! budgets and adaptive bookkeeping.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::batch::{CompressedPacket, Sample};

use super::{
    bitpack::BitPacked, dictionary::Dictionary, fallback::BinaryDelta, fallback::BinaryRle,
    fallback::RawBinary, semantic_rle::SemanticRle, stats::AdaptiveStats,
    temporal_delta::TemporalDelta, Codec, RegisterType, MAX_PACKET_SIZE,
};

/// Per-codec time budget. A codec whose encode+verify pass exceeds this is
/// still scored if it finished, but a codec that would start after the
/// *total* budget has elapsed is skipped entirely.
const PER_CODEC_BUDGET: Duration = Duration::from_millis(50);
/// Total wall-clock budget for the whole tournament.
const TOTAL_BUDGET: Duration = Duration::from_millis(200);

/// Run the full tournament over `samples` and return the winning packet.
/// Always succeeds: if every advanced codec fails or overruns, raw binary
/// is the guaranteed fallback.
pub fn run(
    samples: &[Sample],
    register_types: &HashMap<u16, RegisterType>,
    stats: &mut AdaptiveStats,
) -> CompressedPacket {
    let start = Instant::now();
    let semantic_rle = SemanticRle::new(register_types);

    let codecs: Vec<&dyn Codec> = vec![
        &Dictionary,
        &TemporalDelta,
        &semantic_rle,
        &BitPacked,
        &BinaryDelta,
        &BinaryRle,
        &RawBinary,
    ];

    let mut entrants = Vec::with_capacity(codecs.len());
    let mut best: Option<(u8, Vec<u8>)> = None;

    for codec in &codecs {
        if start.elapsed() >= TOTAL_BUDGET {
            break;
        }
        let attempt_start = Instant::now();
        if let Some(body) = try_codec(*codec, samples) {
            if attempt_start.elapsed() <= PER_CODEC_BUDGET || codec.id() == RawBinary.id() {
                entrants.push(codec.id());
                let better = best
                    .as_ref()
                    .map_or(true, |(_, current)| body.len() < current.len());
                if better {
                    best = Some((codec.id(), body));
                }
            }
        }
    }

    let (codec_id, bytes) = best.unwrap_or_else(|| {
        // RawBinary never declines for a non-empty batch; an empty batch
        // should never reach the tournament (the pipeline doesn't flush
        // an empty accumulator), but cover it defensively.
        let body = RawBinary.encode(samples).unwrap_or_default();
        (RawBinary.id(), body)
    });

    if !entrants.contains(&codec_id) {
        entrants.push(codec_id);
    }

    let raw_len = RawBinary
        .encode(samples)
        .map_or(bytes.len().max(1), |b| b.len().max(1));
    let ratio = bytes.len() as f32 / raw_len as f32;
    stats.record_tournament(&entrants, codec_id, ratio);

    CompressedPacket { codec_id, bytes }
}

/// Encode with `codec` and verify the round trip before accepting the
/// result. Declines if encode fails, the body would overflow
/// [`MAX_PACKET_SIZE`], or the round trip doesn't meet the codec's own
/// correctness criterion.
fn try_codec(codec: &dyn Codec, samples: &[Sample]) -> Option<Vec<u8>> {
    let body = codec.encode(samples)?;
    if 1 + body.len() > MAX_PACKET_SIZE {
        return None;
    }
    let decoded = codec.decode(&body, &[])?;
    if !codec.round_trip_ok(samples, &decoded, &[]) {
        return None;
    }
    Some(body)
}
