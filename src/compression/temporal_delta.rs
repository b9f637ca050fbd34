//! Temporal Delta codec (0x71) — groups samples by register into per-column
//! time series, then delta-encodes each column independently. Wins over
//! [`super::fallback::BinaryDelta`]'s flat delta stream whenever a batch
//! interleaves several registers, since a flat delta would otherwise jump
//! between unrelated columns on every sample.

use std::collections::HashMap;

use crate::batch::Sample;

use super::{codec_id, decode_header, encode_header, Codec, RegisterType};

pub struct TemporalDelta;

impl Codec for TemporalDelta {
    fn id(&self) -> u8 {
        codec_id::TEMPORAL_DELTA
    }

    fn name(&self) -> &'static str {
        "temporal-delta"
    }

    fn encode(&self, samples: &[Sample]) -> Option<Vec<u8>> {
        if samples.is_empty() {
            return None;
        }
        let mut columns: Vec<(u16, Vec<u16>)> = Vec::new();
        for s in samples {
            match columns.iter_mut().find(|(reg, _)| *reg == s.register) {
                Some((_, values)) => values.push(s.value),
                None => columns.push((s.register, vec![s.value])),
            }
        }

        let mut out = encode_header(samples);
        out.extend_from_slice(&(columns.len() as u16).to_le_bytes());
        for (register, values) in &columns {
            out.extend_from_slice(&register.to_le_bytes());
            out.extend_from_slice(&(values.len() as u16).to_le_bytes());
            out.extend_from_slice(&values[0].to_le_bytes());
            let mut prev = i32::from(values[0]);
            for &v in &values[1..] {
                let delta = i32::from(v) - prev;
                out.extend_from_slice(&delta.to_le_bytes());
                prev = i32::from(v);
            }
        }
        Some(out)
    }

    fn decode(&self, body: &[u8], _register_types: &[RegisterType]) -> Option<Vec<Sample>> {
        let (registers, rest) = decode_header(body)?;
        if rest.len() < 2 {
            return None;
        }
        let column_count = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        let mut cursor = 2usize;
        let mut queues: HashMap<u16, std::collections::VecDeque<u16>> = HashMap::new();

        for _ in 0..column_count {
            if rest.len() < cursor + 6 {
                return None;
            }
            let register = u16::from_le_bytes([rest[cursor], rest[cursor + 1]]);
            let count = u16::from_le_bytes([rest[cursor + 2], rest[cursor + 3]]) as usize;
            let first = u16::from_le_bytes([rest[cursor + 4], rest[cursor + 5]]);
            cursor += 6;
            if count == 0 {
                return None;
            }

            let mut values = Vec::with_capacity(count);
            values.push(first);
            let mut value = i32::from(first);
            for _ in 1..count {
                if rest.len() < cursor + 4 {
                    return None;
                }
                let delta = i32::from_le_bytes([
                    rest[cursor],
                    rest[cursor + 1],
                    rest[cursor + 2],
                    rest[cursor + 3],
                ]);
                cursor += 4;
                value += delta;
                values.push(u16::try_from(value).ok()?);
            }
            queues.insert(register, values.into_iter().collect());
        }

        let mut out = Vec::with_capacity(registers.len());
        for register in registers {
            let value = queues.get_mut(&register)?.pop_front()?;
            out.push(Sample { register, value, timestamp_ms: 0 });
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(register: u16, value: u16) -> Sample {
        Sample { register, value, timestamp_ms: 0 }
    }

    #[test]
    fn round_trips_interleaved_registers() {
        let codec = TemporalDelta;
        let samples = vec![
            sample(0, 100),
            sample(1, 5000),
            sample(0, 102),
            sample(1, 5010),
            sample(0, 99),
            sample(1, 4995),
        ];
        let encoded = codec.encode(&samples).unwrap();
        let decoded = codec.decode(&encoded, &[]).unwrap();
        assert!(codec.round_trip_ok(&samples, &decoded, &[]));
    }

    #[test]
    fn round_trips_single_register_series() {
        let codec = TemporalDelta;
        let samples = vec![sample(3, 10), sample(3, 12), sample(3, 9), sample(3, 9)];
        let encoded = codec.encode(&samples).unwrap();
        let decoded = codec.decode(&encoded, &[]).unwrap();
        assert!(codec.round_trip_ok(&samples, &decoded, &[]));
    }

    #[test]
    fn empty_batch_declines() {
        assert!(TemporalDelta.encode(&[]).is_none());
    }
}
