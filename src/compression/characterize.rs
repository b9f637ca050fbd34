//! Data characterization — statistics the tournament and adaptive learner
//! use to judge which codec is likely to win before actually running them.

/// Summary statistics computed over one batch's raw values, in the order
/// the batch holds them (not sorted).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataCharacteristics {
    /// Fraction of consecutive pairs that are exactly equal (0.0..=1.0).
    pub repeat_ratio: f32,
    /// Average absolute difference between consecutive values.
    pub avg_absolute_delta: f32,
    /// Fraction of consecutive deltas whose magnitude exceeds a quarter of
    /// the value range (0.0..=1.0). High ratio favors raw/bit-packed over
    /// delta-based codecs.
    pub large_delta_ratio: f32,
    /// `max - min` over the batch.
    pub value_range: u16,
    /// Count of distinct values in the batch.
    pub unique_count: usize,
    /// Minimum bits needed to represent `value_range`.
    pub optimal_bit_width: u8,
    /// Shannon entropy of the value distribution, in bits.
    pub shannon_entropy: f32,
}

/// Characterize a slice of raw register values.
pub fn characterize(values: &[u16]) -> DataCharacteristics {
    if values.is_empty() {
        return DataCharacteristics {
            repeat_ratio: 0.0,
            avg_absolute_delta: 0.0,
            large_delta_ratio: 0.0,
            value_range: 0,
            unique_count: 0,
            optimal_bit_width: 0,
            shannon_entropy: 0.0,
        };
    }

    let min = *values.iter().min().unwrap();
    let max = *values.iter().max().unwrap();
    let value_range = max - min;

    let pairs = values.len().saturating_sub(1).max(1);
    let (equal_pairs, delta_sum, large_deltas) = values.windows(2).fold(
        (0u32, 0f32, 0u32),
        |(eq, sum, large), w| {
            let delta = (i32::from(w[1]) - i32::from(w[0])).unsigned_abs();
            let is_large = value_range > 0 && delta > u32::from(value_range) / 4;
            (
                eq + u32::from(w[0] == w[1]),
                sum + delta as f32,
                large + u32::from(is_large),
            )
        },
    );

    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let unique_count = sorted.len();

    let optimal_bit_width = bits_for_range(value_range);
    let shannon_entropy = entropy_bits(values);

    DataCharacteristics {
        repeat_ratio: equal_pairs as f32 / pairs as f32,
        avg_absolute_delta: delta_sum / pairs as f32,
        large_delta_ratio: large_deltas as f32 / pairs as f32,
        value_range,
        unique_count,
        optimal_bit_width,
        shannon_entropy,
    }
}

/// Minimum number of bits needed to represent values `0..=range`.
pub fn bits_for_range(range: u16) -> u8 {
    if range == 0 {
        return 1;
    }
    16 - range.leading_zeros() as u8
}

fn entropy_bits(values: &[u16]) -> f32 {
    use std::collections::HashMap;
    let mut counts: HashMap<u16, u32> = HashMap::new();
    for &v in values {
        *counts.entry(v).or_insert(0) += 1;
    }
    let total = values.len() as f32;
    counts
        .values()
        .map(|&c| {
            let p = c as f32 / total;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_series_has_zero_entropy_and_full_repeat() {
        let values = [42u16; 8];
        let c = characterize(&values);
        assert_eq!(c.repeat_ratio, 1.0);
        assert_eq!(c.value_range, 0);
        assert_eq!(c.shannon_entropy, 0.0);
        assert_eq!(c.unique_count, 1);
    }

    #[test]
    fn bits_for_range_matches_expected_widths() {
        assert_eq!(bits_for_range(0), 1);
        assert_eq!(bits_for_range(1), 1);
        assert_eq!(bits_for_range(255), 8);
        assert_eq!(bits_for_range(256), 9);
        assert_eq!(bits_for_range(65535), 16);
    }

    #[test]
    fn empty_input_does_not_panic() {
        let c = characterize(&[]);
        assert_eq!(c.unique_count, 0);
    }

    #[test]
    fn alternating_values_have_high_repeat_free_entropy() {
        let values = [1u16, 2, 1, 2, 1, 2];
        let c = characterize(&values);
        assert_eq!(c.repeat_ratio, 0.0);
        assert!((c.shannon_entropy - 1.0).abs() < 0.01);
    }
}
