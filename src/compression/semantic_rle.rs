//! Semantic RLE codec (0x50) — a lossy run-length encoding that collapses a
//! run of samples whose values stay within their register's physical
//! tolerance (see [`RegisterType::tolerance_raw`]) of the run's anchor
//! value, rather than requiring an exact match like [`super::fallback::BinaryRle`].
//! Good for noisy-but-stable analog readings (voltage, temperature) where
//! bit-for-bit fidelity isn't needed.

use std::collections::HashMap;

use crate::batch::Sample;

use super::{codec_id, decode_header, encode_header, Codec, RegisterType};

/// Run-length codec parameterized by each register's acceptable deviation.
/// Built fresh per tournament run from the currently polled register set,
/// since the tolerance table depends on which registers are selected.
pub struct SemanticRle {
    tolerances: HashMap<u16, u16>,
}

impl SemanticRle {
    /// Build from a register-address to physical-type mapping.
    pub fn new(register_types: &HashMap<u16, RegisterType>) -> Self {
        let tolerances = register_types
            .iter()
            .map(|(&addr, &ty)| (addr, ty.tolerance_raw()))
            .collect();
        Self { tolerances }
    }

    fn tolerance_for(&self, register: u16) -> u16 {
        self.tolerances.get(&register).copied().unwrap_or(0)
    }
}

impl Codec for SemanticRle {
    fn id(&self) -> u8 {
        codec_id::SEMANTIC_RLE
    }

    fn name(&self) -> &'static str {
        "semantic-rle"
    }

    fn encode(&self, samples: &[Sample]) -> Option<Vec<u8>> {
        if samples.is_empty() {
            return None;
        }
        let mut out = encode_header(samples);
        let mut i = 0;
        while i < samples.len() {
            let anchor = samples[i].value;
            let tol = i32::from(self.tolerance_for(samples[i].register));
            let mut run = 1usize;
            while i + run < samples.len()
                && (i32::from(samples[i + run].value) - i32::from(anchor)).abs() <= tol
                && run < usize::from(u16::MAX)
            {
                run += 1;
            }
            out.extend_from_slice(&anchor.to_le_bytes());
            out.extend_from_slice(&(run as u16).to_le_bytes());
            i += run;
        }
        Some(out)
    }

    fn decode(&self, body: &[u8], _register_types: &[RegisterType]) -> Option<Vec<Sample>> {
        let (registers, rest) = decode_header(body)?;
        let mut values = Vec::with_capacity(registers.len());
        for chunk in rest.chunks_exact(4) {
            let anchor = u16::from_le_bytes([chunk[0], chunk[1]]);
            let run = u16::from_le_bytes([chunk[2], chunk[3]]);
            for _ in 0..run {
                values.push(anchor);
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

    fn round_trip_ok(&self, original: &[Sample], decoded: &[Sample], _register_types: &[RegisterType]) -> bool {
        original.len() == decoded.len()
            && original.iter().zip(decoded.iter()).all(|(a, b)| {
                a.register == b.register
                    && (i32::from(a.value) - i32::from(b.value)).abs()
                        <= i32::from(self.tolerance_for(a.register))
            })
    }
}
