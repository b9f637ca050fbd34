//! Deadline Monitor — distinguishes network-induced task-deadline misses
//! from systemic failures, so a transient WAN outage doesn't trigger an
//! unnecessary watchdog reboot.

use std::time::{Duration, Instant};

/// Circular buffer capacity: the most recent K miss timestamps considered
/// for the restart decision.
const K: usize = 20;
/// Misses older than this are no longer "recent".
const RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Grace period after the network comes back before a miss streak can
/// trigger a restart again.
const GRACE_PERIOD: Duration = Duration::from_secs(60);
/// Window purged of network-classified misses on `on_network_restored()`.
const PURGE_WINDOW: Duration = Duration::from_secs(2 * 60);

#[derive(Debug, Clone, Copy)]
struct Miss {
    at: Instant,
    network_related: bool,
}

/// Tracks recent task-deadline misses across the whole device, not per task
/// — the supervisor reports every miss here regardless of which task
/// incurred it.
pub struct DeadlineMonitor {
    recent: Vec<Miss>,
    lifetime_misses: u64,
    network_misses: u64,
    network_restored_at: Option<Instant>,
}

impl DeadlineMonitor {
    pub fn new() -> Self {
        Self {
            recent: Vec::with_capacity(K),
            lifetime_misses: 0,
            network_misses: 0,
            network_restored_at: None,
        }
    }

    pub fn lifetime_misses(&self) -> u64 {
        self.lifetime_misses
    }

    pub fn network_misses(&self) -> u64 {
        self.network_misses
    }

    /// Record a deadline miss. `network_related` should be set when the
    /// task's failure stemmed from a mutex timeout following a reported
    /// network I/O error — the only context in which that classification
    /// is known.
    pub fn record_miss(&mut self, network_related: bool) {
        self.lifetime_misses += 1;
        if network_related {
            self.network_misses += 1;
        }
        if self.recent.len() == K {
            self.recent.remove(0);
        }
        self.recent.push(Miss { at: Instant::now(), network_related });
    }

    /// Call once the network link is confirmed back up. Purges
    /// network-classified misses from the last [`PURGE_WINDOW`] (assumed
    /// caused by the outage) and opens a [`GRACE_PERIOD`] during which
    /// `should_restart()` won't fire even if the recent-miss count is high.
    pub fn on_network_restored(&mut self) {
        let now = Instant::now();
        self.recent
            .retain(|m| !(m.network_related && now.duration_since(m.at) <= PURGE_WINDOW));
        self.network_restored_at = Some(now);
    }

    fn recent_miss_count(&self) -> usize {
        let now = Instant::now();
        self.recent.iter().filter(|m| now.duration_since(m.at) <= RECENT_WINDOW).count()
    }

    fn within_grace_period(&self) -> bool {
        self.network_restored_at
            .is_some_and(|t| Instant::now().duration_since(t) < GRACE_PERIOD)
    }

    /// Whether accumulated misses warrant a watchdog-triggered reboot:
    /// `recent misses >= K` and not currently within the post-outage grace
    /// period.
    pub fn should_restart(&self) -> bool {
        self.recent_miss_count() >= K && !self.within_grace_period()
    }
}

impl Default for DeadlineMonitor {
    fn default() -> Self {
        Self::new()
    }
}
