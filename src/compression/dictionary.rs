//! Dictionary codec (0xD0) — groups samples into fixed-size "pattern
//! vectors" (one per poll cycle, since the pipeline reads the same register
//! set every cycle), builds a dictionary of the distinct vectors seen in the
//! batch, and stores each cycle as a dictionary index. Wins when the
//! inverter repeats a small number of operating states (e.g. steady
//! daylight output, or idle-at-night) across many poll cycles.

use crate::batch::Sample;

use super::{codec_id, decode_header, encode_header, Codec, RegisterType};

pub struct Dictionary;

impl Codec for Dictionary {
    fn id(&self) -> u8 {
        codec_id::DICTIONARY
    }

    fn name(&self) -> &'static str {
        "dictionary"
    }

    fn encode(&self, samples: &[Sample]) -> Option<Vec<u8>> {
        if samples.is_empty() {
            return None;
        }
        let group_size = cycle_length(samples);
        if group_size == 0 || samples.len() % group_size != 0 {
            return None;
        }

        let mut dict: Vec<Vec<u16>> = Vec::new();
        let mut indices: Vec<u16> = Vec::with_capacity(samples.len() / group_size);
        for group in samples.chunks(group_size) {
            // every group must share the same register ordering, or this
            // batch isn't cycle-regular and the codec declines.
            if group.iter().map(|s| s.register).ne(samples[..group_size].iter().map(|s| s.register)) {
                return None;
            }
            let pattern: Vec<u16> = group.iter().map(|s| s.value).collect();
            let index = match dict.iter().position(|p| p == &pattern) {
                Some(i) => i,
                None => {
                    dict.push(pattern);
                    dict.len() - 1
                }
            };
            indices.push(u16::try_from(index).ok()?);
        }

        let mut out = encode_header(samples);
        out.extend_from_slice(&(group_size as u16).to_le_bytes());
        out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
        for pattern in &dict {
            for &v in pattern {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        for index in indices {
            out.extend_from_slice(&index.to_le_bytes());
        }
        Some(out)
    }

    fn decode(&self, body: &[u8], _register_types: &[RegisterType]) -> Option<Vec<Sample>> {
        let (registers, rest) = decode_header(body)?;
        if rest.len() < 4 {
            return None;
        }
        let group_size = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        let dict_count = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        if group_size == 0 {
            return None;
        }

        let mut cursor = 4usize;
        let mut dict = Vec::with_capacity(dict_count);
        for _ in 0..dict_count {
            if rest.len() < cursor + group_size * 2 {
                return None;
            }
            let pattern: Vec<u16> = rest[cursor..cursor + group_size * 2]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            dict.push(pattern);
            cursor += group_size * 2;
        }

        let group_count = registers.len() / group_size;
        if registers.len() % group_size != 0 || rest.len() < cursor + group_count * 2 {
            return None;
        }

        let mut out = Vec::with_capacity(registers.len());
        for (g, reg_group) in registers.chunks(group_size).enumerate() {
            let idx_off = cursor + g * 2;
            let index = u16::from_le_bytes([rest[idx_off], rest[idx_off + 1]]) as usize;
            let pattern = dict.get(index)?;
            for (register, &value) in reg_group.iter().zip(pattern) {
                out.push(Sample { register: *register, value, timestamp_ms: 0 });
            }
        }
        Some(out)
    }
}

/// Length of the repeating register cycle: the offset of the first
/// recurrence of `samples[0].register`, or the whole batch if it never
/// repeats (a single-cycle batch).
fn cycle_length(samples: &[Sample]) -> usize {
    let first = samples[0].register;
    samples[1..]
        .iter()
        .position(|s| s.register == first)
        .map_or(samples.len(), |offset| offset + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(register: u16, value: u16) -> Sample {
        Sample { register, value, timestamp_ms: 0 }
    }

    fn cycle(values: [u16; 3]) -> Vec<Sample> {
        vec![sample(0, values[0]), sample(1, values[1]), sample(2, values[2])]
    }

    #[test]
    fn collapses_repeated_cycles_into_a_small_dictionary() {
        let codec = Dictionary;
        let mut samples = Vec::new();
        for _ in 0..4 {
            samples.extend(cycle([10, 20, 30]));
        }
        samples.extend(cycle([11, 20, 30]));
        let encoded = codec.encode(&samples).unwrap();
        let decoded = codec.decode(&encoded, &[]).unwrap();
        assert!(codec.round_trip_ok(&samples, &decoded, &[]));

        // dict_count is the u16 at a fixed offset after the header + group_size
        let header_len = 2 + samples.len() * 2;
        let dict_count = u16::from_le_bytes([encoded[header_len + 2], encoded[header_len + 3]]);
        assert_eq!(dict_count, 2);
    }

    #[test]
    fn single_cycle_batch_uses_whole_batch_as_group() {
        let codec = Dictionary;
        let samples = cycle([1, 2, 3]);
        let encoded = codec.encode(&samples).unwrap();
        let decoded = codec.decode(&encoded, &[]).unwrap();
        assert!(codec.round_trip_ok(&samples, &decoded, &[]));
    }

    #[test]
    fn irregular_register_order_declines() {
        let codec = Dictionary;
        let samples = vec![sample(0, 1), sample(1, 2), sample(2, 3), sample(1, 4), sample(0, 5), sample(2, 6)];
        assert!(codec.encode(&samples).is_none());
    }

    #[test]
    fn empty_batch_declines() {
        assert!(Dictionary.encode(&[]).is_none());
    }
}
