//! Bit-Packed codec (0x01) — stores each value as `base + packed_delta`,
//! where `packed_delta` occupies the minimum bit width needed to span the
//! batch's value range. Lossless; wins when values cluster in a narrow band
//! that doesn't align to a byte boundary (e.g. an 11-bit ADC reading).

use crate::batch::Sample;

use super::{characterize, codec_id, decode_header, encode_header, Codec, RegisterType};

pub struct BitPacked;

impl Codec for BitPacked {
    fn id(&self) -> u8 {
        codec_id::BIT_PACKED
    }

    fn name(&self) -> &'static str {
        "bit-packed"
    }

    fn encode(&self, samples: &[Sample]) -> Option<Vec<u8>> {
        if samples.is_empty() {
            return None;
        }
        let values: Vec<u16> = samples.iter().map(|s| s.value).collect();
        let base = *values.iter().min().unwrap();
        let range = values.iter().max().unwrap() - base;
        let bit_width = characterize::bits_for_range(range).clamp(1, 16);

        let mut out = encode_header(samples);
        out.extend_from_slice(&base.to_le_bytes());
        out.push(bit_width);

        let mut writer = BitWriter::new();
        for &v in &values {
            writer.push(u32::from(v - base), bit_width);
        }
        out.extend_from_slice(&writer.finish());
        Some(out)
    }

    fn decode(&self, body: &[u8], _register_types: &[RegisterType]) -> Option<Vec<Sample>> {
        let (registers, rest) = decode_header(body)?;
        if rest.len() < 3 {
            return None;
        }
        let base = u16::from_le_bytes([rest[0], rest[1]]);
        let bit_width = rest[2];
        if bit_width == 0 || bit_width > 16 {
            return None;
        }
        let bits = &rest[3..];
        let mut reader = BitReader::new(bits);

        let mut out = Vec::with_capacity(registers.len());
        for register in registers {
            let delta = reader.pull(bit_width)? as u16;
            out.push(Sample {
                register,
                value: base.checked_add(delta)?,
                timestamp_ms: 0,
            });
        }
        Some(out)
    }
}

/// Packs fixed-width fields into a byte buffer, MSB-first within each field.
struct BitWriter {
    bytes: Vec<u8>,
    bit_pos: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self { bytes: Vec::new(), bit_pos: 0 }
    }

    fn push(&mut self, value: u32, width: u8) {
        for i in (0..width).rev() {
            let bit = (value >> i) & 1;
            if self.bit_pos == 0 {
                self.bytes.push(0);
            }
            let byte = self.bytes.last_mut().unwrap();
            *byte |= (bit as u8) << (7 - self.bit_pos);
            self.bit_pos = (self.bit_pos + 1) % 8;
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, bit_pos: 0 }
    }

    fn pull(&mut self, width: u8) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..width {
            let byte_idx = self.bit_pos / 8;
            let bit_idx = self.bit_pos % 8;
            let byte = *self.bytes.get(byte_idx)?;
            let bit = (byte >> (7 - bit_idx)) & 1;
            value = (value << 1) | u32::from(bit);
            self.bit_pos += 1;
        }
        Some(value)
    }
}
