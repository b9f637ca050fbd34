//! Task Supervisor — owns every periodic task's thread, the cross-task
//! mutexes those tasks contend on, and the [`DeadlineMonitor`] that decides
//! whether a run of missed deadlines warrants a watchdog reboot.
//!
//! Grounded on [`crate::drivers::task_pin`]'s core-pinned `std::thread`
//! spawning; generalized from that module's single-purpose driver threads
//! into a named, period-driven task loop shared by every subsystem.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::warn;

use crate::batch::{CompressedRing, SampleBatch};
use crate::deadline::DeadlineMonitor;
use crate::drivers::task_pin::{self, Core};

/// Every periodic task this firmware runs, in the priority order the
/// scheduling model assigns them (highest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    SensorPoll,
    Upload,
    Compression,
    Command,
    Config,
    Statistics,
    PowerReport,
    Firmware,
    Watchdog,
}

impl TaskKind {
    /// FreeRTOS task priority (higher runs first on contention).
    pub fn priority(self) -> u8 {
        match self {
            TaskKind::SensorPoll => 9,
            TaskKind::Upload => 8,
            TaskKind::Compression => 7,
            TaskKind::Command => 6,
            TaskKind::Config => 5,
            TaskKind::Statistics => 4,
            TaskKind::PowerReport => 3,
            TaskKind::Firmware => 2,
            TaskKind::Watchdog => 1,
        }
    }

    /// Core affinity: network-facing tasks on `Pro` (core-0), sensor-facing
    /// tasks on `App` (core-1); housekeeping tasks that don't block on I/O
    /// join the sensor-facing core since they're cheap and latency-
    /// insensitive.
    pub fn core(self) -> Core {
        match self {
            TaskKind::Upload | TaskKind::Command | TaskKind::Config | TaskKind::Firmware | TaskKind::PowerReport => {
                Core::Pro
            }
            TaskKind::SensorPoll | TaskKind::Compression | TaskKind::Statistics | TaskKind::Watchdog => Core::App,
        }
    }

    /// Per-tick deadline; a tick that runs longer than this counts as a
    /// miss against the [`DeadlineMonitor`].
    pub fn deadline(self) -> Duration {
        match self {
            TaskKind::SensorPoll => Duration::from_secs(2),
            TaskKind::Compression => Duration::from_secs(2),
            TaskKind::Upload => Duration::from_secs(5),
            TaskKind::Command => Duration::from_secs(3),
            TaskKind::Config => Duration::from_secs(3),
            TaskKind::Firmware => Duration::from_secs(10),
            // Statistics, power-report, and watchdog ticks have no I/O on
            // the critical path and are bounded generously to catch only
            // genuine hangs.
            TaskKind::Statistics | TaskKind::PowerReport | TaskKind::Watchdog => Duration::from_secs(5),
        }
    }

    fn label(self) -> &'static str {
        match self {
            TaskKind::SensorPoll => "sensor-poll\0",
            TaskKind::Upload => "upload\0",
            TaskKind::Compression => "compression\0",
            TaskKind::Command => "command\0",
            TaskKind::Config => "config\0",
            TaskKind::Statistics => "statistics\0",
            TaskKind::PowerReport => "power-report\0",
            TaskKind::Firmware => "firmware\0",
            TaskKind::Watchdog => "watchdog\0",
        }
    }

    /// Stack allocation for this task's pinned thread, in KiB.
    fn stack_kb(self) -> usize {
        match self {
            TaskKind::SensorPoll | TaskKind::Compression => 8,
            TaskKind::Upload | TaskKind::Firmware => 12,
            _ => 6,
        }
    }
}

/// A `std::sync::Mutex` with a bounded, polling `try_lock_for` — the
/// network client and compression pipeline mutexes need a timeout, which
/// `std::sync::Mutex` doesn't offer directly.
pub struct TimedMutex<T> {
    inner: Mutex<T>,
}

impl<T> TimedMutex<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    /// Poll for the lock until it's acquired or `timeout` elapses. A task
    /// that times out aborts its tick and reports a miss — it never blocks
    /// indefinitely.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Some(guard),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(std::sync::TryLockError::Poisoned(p)) => return Some(p.into_inner()),
            }
        }
    }
}

/// Timeouts for acquiring the shared network-client mutex, one per
/// network-facing task.
pub mod network_timeout {
    use std::time::Duration;
    pub const UPLOAD: Duration = Duration::from_secs(4);
    pub const COMMAND: Duration = Duration::from_secs(2);
    pub const CONFIG: Duration = Duration::from_secs(2);
    pub const FIRMWARE: Duration = Duration::from_secs(5);
}

/// Timeout for acquiring the shared compression-pipeline mutex (only the
/// poll+compress chain contends on it).
pub const COMPRESSION_MUTEX_TIMEOUT: Duration = Duration::from_millis(100);

/// Cross-task resources every task may need to borrow. `S` is whatever
/// persistence backend the device was built with; `T` is the register
/// protocol's transport (the inverter UART on hardware).
pub struct SharedResources<S, T> {
    /// Serializes every outbound HTTP call; there's exactly one network
    /// client.
    pub network: TimedMutex<()>,
    /// The persistent store is internally single-writer; this mutex
    /// enforces that across tasks. Reads still go through the store's own
    /// lock-free accessor methods where the backend allows it.
    pub store: TimedMutex<S>,
    /// Serializes access to the inverter link — the Polling Pipeline and the
    /// Command Executor both exchange frames over the same physical bus.
    pub transport: TimedMutex<T>,
    /// Guards the compression tournament's adaptive stats, the only shared
    /// mutable state the poll+compress chain touches.
    pub compression: TimedMutex<crate::compression::stats::AdaptiveStats>,
    /// Filled batches handed from the Polling Pipeline to the Compression
    /// task; drained oldest-first.
    pub pending_batches: TimedMutex<VecDeque<SampleBatch>>,
    /// Compressed packets awaiting upload.
    pub compressed_ring: TimedMutex<CompressedRing>,
}

impl<S, T> SharedResources<S, T> {
    pub fn new(store: S, transport: T) -> Self {
        Self {
            network: TimedMutex::new(()),
            store: TimedMutex::new(store),
            transport: TimedMutex::new(transport),
            compression: TimedMutex::new(crate::compression::stats::AdaptiveStats::new()),
            pending_batches: TimedMutex::new(VecDeque::new()),
            compressed_ring: TimedMutex::new(CompressedRing::new()),
        }
    }
}

/// Timeout for acquiring the shared inverter-transport mutex — both the
/// sensor-poll and command tasks contend on it.
pub const TRANSPORT_MUTEX_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns the [`DeadlineMonitor`] and spawns every periodic task thread.
/// Cloning is cheap (an `Arc` around the shared monitor) so each spawned
/// task closure can hold its own handle.
#[derive(Clone)]
pub struct TaskSupervisor {
    monitor: Arc<Mutex<DeadlineMonitor>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self { monitor: Arc::new(Mutex::new(DeadlineMonitor::new())) }
    }

    pub fn should_restart(&self) -> bool {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner()).should_restart()
    }

    pub fn on_network_restored(&self) {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner()).on_network_restored();
    }

    pub fn lifetime_misses(&self) -> u64 {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner()).lifetime_misses()
    }

    /// Run `tick` once, timing it against `kind`'s deadline and recording a
    /// miss if it overruns. `tick` returns whether its own failure (if any)
    /// was network-related, so the Deadline Monitor can tell outages apart
    /// from real hangs.
    pub fn run_tick(&self, kind: TaskKind, tick: impl FnOnce() -> bool) -> bool {
        let started = Instant::now();
        let network_related = tick();
        let elapsed = started.elapsed();
        if elapsed > kind.deadline() {
            warn!("supervisor: {:?} tick took {elapsed:?}, exceeding its {:?} deadline", kind, kind.deadline());
            self.monitor.lock().unwrap_or_else(|e| e.into_inner()).record_miss(network_related);
        }
        network_related
    }

    /// Spawn `kind`'s task loop, core-pinned and prioritized per its table
    /// entry, calling `body` once per `period`. `body` returns whether its
    /// tick's eventual failure (if any) was network-related, for deadline
    /// classification.
    pub fn spawn_periodic(
        &self,
        kind: TaskKind,
        period: Duration,
        mut body: impl FnMut() -> bool + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        let supervisor = self.clone();
        task_pin::spawn_on_core(kind.core(), kind.priority(), kind.stack_kb(), kind.label(), move || loop {
            supervisor.run_tick(kind, &mut body);
            std::thread::sleep(period);
        })
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
