//! Adaptive codec statistics — a rolling record of how each codec has
//! performed recently, purely diagnostic. The tournament always runs every
//! codec regardless of history (no short-circuiting on a "likely winner"),
//! but these numbers are worth surfacing through diagnostics so a human can
//! see which codec actually earns its keep on this inverter's data.

use std::collections::HashMap;

/// Rolling performance record for one codec id.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecStats {
    pub wins: u32,
    pub attempts: u32,
    /// Exponential moving average of the compression ratio
    /// (`compressed_len / raw_len`) on the attempts this codec won.
    pub avg_ratio: f32,
}

impl CodecStats {
    const EMA_ALPHA: f32 = 0.2;

    fn record_attempt(&mut self, won: bool, ratio: f32) {
        self.attempts += 1;
        if won {
            self.wins += 1;
            self.avg_ratio = if self.wins == 1 {
                ratio
            } else {
                Self::EMA_ALPHA * ratio + (1.0 - Self::EMA_ALPHA) * self.avg_ratio
            };
        }
    }

    /// Fraction of tournaments this codec has won, of those it entered.
    pub fn win_rate(&self) -> f32 {
        if self.attempts == 0 {
            0.0
        } else {
            self.wins as f32 / self.attempts as f32
        }
    }
}

/// Tracks [`CodecStats`] per codec id across the lifetime of the device.
#[derive(Debug, Default)]
pub struct AdaptiveStats {
    by_codec: HashMap<u8, CodecStats>,
}

impl AdaptiveStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one tournament's outcome: every codec that entered, whether
    /// each won, and the winner's compression ratio.
    pub fn record_tournament(&mut self, entrants: &[u8], winner_id: u8, winner_ratio: f32) {
        for &id in entrants {
            let won = id == winner_id;
            let ratio = if won { winner_ratio } else { 1.0 };
            self.by_codec.entry(id).or_default().record_attempt(won, ratio);
        }
    }

    pub fn get(&self, codec_id: u8) -> CodecStats {
        self.by_codec.get(&codec_id).copied().unwrap_or_default()
    }

    /// The codec id with the highest win rate among those that have entered
    /// at least once, if any have.
    pub fn best_performer(&self) -> Option<u8> {
        self.by_codec
            .iter()
            .max_by(|(_, a), (_, b)| a.win_rate().partial_cmp(&b.win_rate()).unwrap())
            .map(|(&id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::codec_id;

    #[test]
    fn win_rate_tracks_wins_over_attempts() {
        let mut stats = AdaptiveStats::new();
        stats.record_tournament(&[codec_id::RAW_BINARY, codec_id::BIT_PACKED], codec_id::BIT_PACKED, 0.5);
        stats.record_tournament(&[codec_id::RAW_BINARY, codec_id::BIT_PACKED], codec_id::RAW_BINARY, 0.9);
        let bitpack = stats.get(codec_id::BIT_PACKED);
        assert_eq!(bitpack.attempts, 2);
        assert_eq!(bitpack.wins, 1);
        assert!((bitpack.win_rate() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn unseen_codec_has_zero_stats() {
        let stats = AdaptiveStats::new();
        let unseen = stats.get(codec_id::DICTIONARY);
        assert_eq!(unseen.attempts, 0);
        assert_eq!(unseen.win_rate(), 0.0);
    }

    #[test]
    fn best_performer_picks_highest_win_rate() {
        let mut stats = AdaptiveStats::new();
        for _ in 0..3 {
            stats.record_tournament(&[codec_id::RAW_BINARY, codec_id::TEMPORAL_DELTA], codec_id::TEMPORAL_DELTA, 0.4);
        }
        assert_eq!(stats.best_performer(), Some(codec_id::TEMPORAL_DELTA));
    }
}
