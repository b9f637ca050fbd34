//! Fallback codecs — simple, always-correct encodings the tournament can
//! fall back to when none of the purpose-built codecs beat them, or when a
//! purpose-built codec's encoder declines (returns `None`).

use crate::batch::Sample;

use super::{codec_id, decode_header, encode_header, Codec, RegisterType};

/// Raw binary (0x00) — each value stored as a plain u16 LE. Never fails;
/// this is the last-resort codec the tournament always has available.
pub struct RawBinary;

impl Codec for RawBinary {
    fn id(&self) -> u8 {
        codec_id::RAW_BINARY
    }

    fn name(&self) -> &'static str {
        "raw-binary"
    }

    fn encode(&self, samples: &[Sample]) -> Option<Vec<u8>> {
        let mut out = encode_header(samples);
        for s in samples {
            out.extend_from_slice(&s.value.to_le_bytes());
        }
        Some(out)
    }

    fn decode(&self, body: &[u8], _register_types: &[RegisterType]) -> Option<Vec<Sample>> {
        let (registers, rest) = decode_header(body)?;
        if rest.len() < registers.len() * 2 {
            return None;
        }
        Some(
            registers
                .into_iter()
                .zip(rest.chunks_exact(2))
                .map(|(register, c)| Sample {
                    register,
                    value: u16::from_le_bytes([c[0], c[1]]),
                    timestamp_ms: 0,
                })
                .collect(),
        )
    }
}

/// Binary delta (0x02) — first value stored raw, subsequent values stored as
/// a signed i32 delta from the previous one. Good for slowly drifting series
/// that aren't flat enough for semantic RLE.
pub struct BinaryDelta;

impl Codec for BinaryDelta {
    fn id(&self) -> u8 {
        codec_id::BINARY_DELTA
    }

    fn name(&self) -> &'static str {
        "binary-delta"
    }

    fn encode(&self, samples: &[Sample]) -> Option<Vec<u8>> {
        if samples.is_empty() {
            return None;
        }
        let mut out = encode_header(samples);
        out.extend_from_slice(&samples[0].value.to_le_bytes());
        let mut prev = i32::from(samples[0].value);
        for s in &samples[1..] {
            let delta = i32::from(s.value) - prev;
            out.extend_from_slice(&delta.to_le_bytes());
            prev = i32::from(s.value);
        }
        Some(out)
    }

    fn decode(&self, body: &[u8], _register_types: &[RegisterType]) -> Option<Vec<Sample>> {
        let (registers, rest) = decode_header(body)?;
        if registers.is_empty() || rest.len() < 2 {
            return None;
        }
        let mut value = i32::from(u16::from_le_bytes([rest[0], rest[1]]));
        let mut out = Vec::with_capacity(registers.len());
        out.push(Sample {
            register: registers[0],
            value: u16::try_from(value).ok()?,
            timestamp_ms: 0,
        });

        let deltas = &rest[2..];
        if deltas.len() < (registers.len() - 1) * 4 {
            return None;
        }
        for (register, c) in registers[1..].iter().zip(deltas.chunks_exact(4)) {
            let delta = i32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            value += delta;
            out.push(Sample {
                register: *register,
                value: u16::try_from(value).ok()?,
                timestamp_ms: 0,
            });
        }
        Some(out)
    }
}

/// Binary RLE (0x03) — run-length encodes exact repeats of the raw value.
/// Each run is `(value: u16 LE, count: u16 LE)`. Purely numeric, no semantic
/// tolerance — the exact-match sibling of [`super::semantic_rle`].
pub struct BinaryRle;

impl Codec for BinaryRle {
    fn id(&self) -> u8 {
        codec_id::BINARY_RLE
    }

    fn name(&self) -> &'static str {
        "binary-rle"
    }

    fn encode(&self, samples: &[Sample]) -> Option<Vec<u8>> {
        if samples.is_empty() {
            return None;
        }
        let mut out = encode_header(samples);
        let mut i = 0;
        while i < samples.len() {
            let value = samples[i].value;
            let mut run = 1u16;
            while i + (run as usize) < samples.len()
                && samples[i + run as usize].value == value
                && run < u16::MAX
            {
                run += 1;
            }
            out.extend_from_slice(&value.to_le_bytes());
            out.extend_from_slice(&run.to_le_bytes());
            i += run as usize;
        }
        Some(out)
    }

    fn decode(&self, body: &[u8], _register_types: &[RegisterType]) -> Option<Vec<Sample>> {
        let (registers, rest) = decode_header(body)?;
        let mut values = Vec::with_capacity(registers.len());
        for chunk in rest.chunks_exact(4) {
            let value = u16::from_le_bytes([chunk[0], chunk[1]]);
            let run = u16::from_le_bytes([chunk[2], chunk[3]]);
            for _ in 0..run {
                values.push(value);
            }
        }
        if values.len() != registers.len() {
            return None;
        }
        Some(
            registers
                .into_iter()
                .zip(values)
                .map(|(register, value)| Sample { register, value, timestamp_ms: 0 })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(register: u16, value: u16) -> Sample {
        Sample { register, value, timestamp_ms: 0 }
    }

    #[test]
    fn raw_binary_round_trips() {
        let codec = RawBinary;
        let samples = vec![sample(0, 111), sample(1, 222), sample(2, 333)];
        let encoded = codec.encode(&samples).unwrap();
        let decoded = codec.decode(&encoded, &[]).unwrap();
        assert!(codec.round_trip_ok(&samples, &decoded, &[]));
    }

    #[test]
    fn binary_delta_round_trips_increasing_series() {
        let codec = BinaryDelta;
        let samples = vec![sample(0, 1000), sample(1, 1005), sample(2, 998), sample(3, 1050)];
        let encoded = codec.encode(&samples).unwrap();
        let decoded = codec.decode(&encoded, &[]).unwrap();
        assert!(codec.round_trip_ok(&samples, &decoded, &[]));
    }

    #[test]
    fn binary_delta_empty_batch_declines() {
        assert!(BinaryDelta.encode(&[]).is_none());
    }

    #[test]
    fn binary_rle_collapses_repeated_runs() {
        let codec = BinaryRle;
        let samples = vec![
            sample(0, 7),
            sample(1, 7),
            sample(2, 7),
            sample(3, 9),
            sample(4, 9),
        ];
        let encoded = codec.encode(&samples).unwrap();
        // header (2 + 5*2) + two runs of 4 bytes each = 12 + 8
        assert_eq!(encoded.len(), 2 + 10 + 8);
        let decoded = codec.decode(&encoded, &[]).unwrap();
        assert!(codec.round_trip_ok(&samples, &decoded, &[]));
    }

    #[test]
    fn binary_rle_round_trips_no_repeats() {
        let codec = BinaryRle;
        let samples = vec![sample(0, 1), sample(1, 2), sample(2, 3)];
        let encoded = codec.encode(&samples).unwrap();
        let decoded = codec.decode(&encoded, &[]).unwrap();
        assert!(codec.round_trip_ok(&samples, &decoded, &[]));
    }
}
