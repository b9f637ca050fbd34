//! Register Polling Pipeline — reads the active register selection off the
//! inverter each tick, decodes the response into [`Sample`]s, and publishes
//! them on a bounded, non-blocking sample queue for the compression stage to
//! drain. Fault handling is delegated to [`crate::fault`]; this module only
//! drives the retry loop and decides when a register-selection change
//! requires the in-flight batch to be flushed early.

use std::time::{Duration, Instant};

use log::warn;

use crate::batch::{Sample, SampleBatch};
use crate::error::Error;
use crate::fault::{Backoff, FaultClass, RetryDriver};
use crate::protocol::{self, Transport, ValidationOutcome};

const DEVICE_ADDR: u8 = 0x01;
const POLL_TIMEOUT_MS: u32 = 500;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(8);

/// Maximum outstanding samples the queue between polling and compression
/// will hold before dropping the oldest entry.
pub const SAMPLE_QUEUE_CAPACITY: usize = 64;

/// Non-blocking, drop-oldest-when-full queue carrying [`Sample`]s from the
/// Polling Pipeline to the Compression Engine. Single producer (the polling
/// task), single consumer (the compression task); internally synchronized
/// by the caller holding no other lock across `push`/`drain_all`.
pub struct SampleQueue {
    slots: std::collections::VecDeque<Sample>,
    capacity: usize,
    drops: u32,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self { slots: std::collections::VecDeque::with_capacity(capacity), capacity, drops: 0 }
    }

    /// Push a sample, dropping the oldest entry if the queue is full. Never
    /// blocks.
    pub fn push(&mut self, sample: Sample) {
        if self.slots.len() >= self.capacity {
            self.slots.pop_front();
            self.drops += 1;
        }
        self.slots.push_back(sample);
    }

    pub fn drain_all(&mut self) -> Vec<Sample> {
        self.slots.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Count of samples dropped for arriving while the queue was full,
    /// since the queue was created.
    pub fn drops(&self) -> u32 {
        self.drops
    }
}

impl Default for SampleQueue {
    fn default() -> Self {
        Self::new(SAMPLE_QUEUE_CAPACITY)
    }
}

/// Outcome of a single poll tick, for the caller to feed into diagnostics
/// and the Deadline Monitor.
#[derive(Debug)]
pub enum PollOutcome {
    /// A sample was decoded and published for every requested register.
    Sampled,
    /// The fault was recovered after one or more retries.
    Recovered { fault: FaultClass, retries: u8 },
    /// The fault exhausted its retry budget or was non-recoverable.
    Failed { fault: FaultClass, retries: u8, error: Error },
}

/// Accumulates samples into [`SampleBatch`]es, tracking the register
/// selection each batch was opened with and flushing early when the
/// selection changes mid-batch (the invariant that every sample in a batch
/// shares one selection).
pub struct BatchAccumulator {
    batch: SampleBatch,
    selection: Vec<u16>,
}

impl BatchAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self { batch: SampleBatch::new(capacity), selection: Vec::new() }
    }

    /// Offer one poll tick's samples (one per requested register, same
    /// timestamp) to the accumulator. If `selection` differs from the
    /// batch's locked-in selection, the current batch is flushed (returned)
    /// and a new one is opened with `selection` before the new samples are
    /// pushed into it.
    pub fn offer(&mut self, selection: &[u16], samples: &[Sample]) -> Option<SampleBatch> {
        let mut flushed = None;
        if !self.batch.is_empty() && self.selection != selection {
            flushed = Some(self.take_and_reset(selection));
        } else if self.batch.is_empty() {
            self.selection = selection.to_vec();
        }

        for &sample in samples {
            if self.batch.push(sample).is_err() {
                // Full: emit what we have, start fresh with the same
                // selection, and retry the push on the new batch.
                let full = self.take_and_reset(selection);
                let _ = self.batch.push(sample);
                return Some(flushed.unwrap_or(full));
            }
        }

        if self.batch.is_full() {
            return Some(self.take_and_reset(selection));
        }
        flushed
    }

    fn take_and_reset(&mut self, new_selection: &[u16]) -> SampleBatch {
        let capacity = self.batch.capacity();
        let finished = std::mem::replace(&mut self.batch, SampleBatch::new(capacity));
        self.selection = new_selection.to_vec();
        finished
    }
}

/// Poll once: build a read frame for `registers`, exchange it, validate,
/// and on success decode + push each register's value onto `queue` with the
/// same acquisition timestamp. On fault, drive the retry loop inline
/// (sleeping cooperatively between attempts) and return the outcome for the
/// caller to log/emit as a [`crate::events::FaultEvent`]. `deadline` is the
/// calling task's total time budget for this call; a retry is never started
/// if its backoff would run past the deadline's remaining slack.
pub fn poll_once<T: Transport>(
    transport: &mut T,
    registers: &[u16],
    queue: &mut SampleQueue,
    timestamp_ms: u64,
    deadline: Duration,
) -> PollOutcome {
    let started = Instant::now();
    let (start, count) = match span_of(registers) {
        Some(span) => span,
        None => {
            return PollOutcome::Failed {
                fault: FaultClass::TruncatedOrMalformed,
                retries: 0,
                error: Error::ProtocolMalformed,
            }
        }
    };

    let mut request = [0u8; protocol::MAX_FRAME_LEN];
    let len = match protocol::build_read_frame(DEVICE_ADDR, start, count, &mut request) {
        Some(len) => len,
        None => {
            return PollOutcome::Failed {
                fault: FaultClass::TruncatedOrMalformed,
                retries: 0,
                error: Error::ProtocolMalformed,
            }
        }
    };

    loop {
        let mut response = [0u8; protocol::MAX_FRAME_LEN];
        let exchanged = protocol::exchange(transport, &request[..len], &mut response, POLL_TIMEOUT_MS);

        let (outcome, n) = match exchanged {
            Ok((n, outcome)) => (outcome, n),
            Err(Error::Timeout) => (ValidationOutcome::Truncated, 0),
            Err(_) => (ValidationOutcome::Malformed, 0),
        };
        let _ = n;

        if outcome == ValidationOutcome::Ok {
            let decoded = protocol::decode_read_response(&response[..n.max(3)], registers);
            for rv in decoded.iter() {
                queue.push(Sample { register: rv.address, value: rv.value, timestamp_ms });
            }
            return PollOutcome::Sampled;
        }

        let fault = match FaultClass::from_validation(outcome) {
            Some(fault) => fault,
            None => return PollOutcome::Sampled,
        };

        let mut driver = RetryDriver::new(fault, Backoff::new(BACKOFF_BASE, BACKOFF_MAX));
        if !driver.should_retry() {
            return PollOutcome::Failed { fault, retries: 0, error: error_for(fault) };
        }

        let mut retries = 0u8;
        loop {
            let delay = driver.next_delay();
            let remaining = deadline.saturating_sub(started.elapsed());
            if delay > remaining {
                warn!(
                    "polling: {fault:?} abandoning retries after {retries} attempt(s): next backoff {delay:?} would exceed {remaining:?} of deadline slack"
                );
                return PollOutcome::Failed { fault, retries, error: error_for(fault) };
            }
            warn!("polling: {fault:?} on attempt {retries}, retrying after {delay:?}");
            std::thread::sleep(delay);

            let mut retry_response = [0u8; protocol::MAX_FRAME_LEN];
            let retried = protocol::exchange(transport, &request[..len], &mut retry_response, POLL_TIMEOUT_MS);
            retries += 1;

            let (retry_outcome, n) = match retried {
                Ok((n, outcome)) => (outcome, n),
                Err(Error::Timeout) => (ValidationOutcome::Truncated, 0),
                Err(_) => (ValidationOutcome::Malformed, 0),
            };

            if retry_outcome == ValidationOutcome::Ok {
                let decoded = protocol::decode_read_response(&retry_response[..n.max(3)], registers);
                for rv in decoded.iter() {
                    queue.push(Sample { register: rv.address, value: rv.value, timestamp_ms });
                }
                return PollOutcome::Recovered { fault, retries };
            }

            if !driver.should_retry() {
                return PollOutcome::Failed { fault, retries, error: error_for(fault) };
            }
        }
    }
}

fn error_for(fault: FaultClass) -> Error {
    match fault {
        FaultClass::Timeout => Error::Timeout,
        FaultClass::CrcError => Error::ProtocolCrc,
        FaultClass::TruncatedOrMalformed => Error::ProtocolMalformed,
        FaultClass::BufferOverflow => Error::BufferOverflow,
        FaultClass::ExceptionTransient(code) | FaultClass::ExceptionPermanent(code) => {
            Error::ProtocolException(code)
        }
    }
}

/// Smallest contiguous `(start, count)` register span covering every address
/// in `registers`. Returns `None` for an empty selection.
fn span_of(registers: &[u16]) -> Option<(u16, u16)> {
    let min = *registers.iter().min()?;
    let max = *registers.iter().max()?;
    Some((min, max - min + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct MockTransport {
        inbox: VecDeque<u8>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self { inbox: VecDeque::new() }
        }
        fn queue_response(&mut self, bytes: &[u8]) {
            self.inbox.extend(bytes);
        }
    }

    impl Transport for MockTransport {
        type Error = ();

        fn write_all(&mut self, _data: &[u8]) -> Result<(), ()> {
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, ()> {
            let mut n = 0;
            while n < buf.len() {
                match self.inbox.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    fn build_read_response(values: &[u16]) -> Vec<u8> {
        use crc::{Crc, CRC_16_MODBUS};
        const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
        let mut body = vec![DEVICE_ADDR, 0x03, (values.len() * 2) as u8];
        for v in values {
            body.extend_from_slice(&v.to_be_bytes());
        }
        let crc = CRC16.checksum(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        body
    }

    #[test]
    fn span_of_covers_noncontiguous_selection() {
        assert_eq!(span_of(&[0, 2, 4]), Some((0, 5)));
    }

    #[test]
    fn span_of_empty_is_none() {
        assert_eq!(span_of(&[]), None);
    }

    #[test]
    fn poll_once_publishes_a_sample_per_register() {
        let mut transport = MockTransport::new();
        transport.queue_response(&build_read_response(&[220, 5, 1100]));
        let mut queue = SampleQueue::new(8);

        let outcome = poll_once(&mut transport, &[0, 1, 4], &mut queue, 1_000, Duration::from_secs(5));
        assert!(matches!(outcome, PollOutcome::Sampled));
        let drained = queue.drain_all();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].value, 220);
        assert_eq!(drained[2].value, 1100);
    }

    #[test]
    fn poll_once_recovers_after_crc_error() {
        let mut transport = MockTransport::new();
        let mut bad = build_read_response(&[1]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        transport.queue_response(&bad);
        transport.queue_response(&build_read_response(&[1]));
        let mut queue = SampleQueue::new(8);

        let outcome = poll_once(&mut transport, &[0], &mut queue, 0, Duration::from_secs(5));
        assert!(matches!(outcome, PollOutcome::Recovered { retries: 1, .. }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn poll_once_aborts_retries_when_deadline_slack_is_insufficient() {
        let mut transport = MockTransport::new();
        let mut bad = build_read_response(&[1]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        transport.queue_response(&bad);
        let mut queue = SampleQueue::new(8);

        // The first backoff is BACKOFF_BASE (500ms); a 10ms deadline can't
        // afford it, so the retry loop must abort before sleeping at all.
        let outcome = poll_once(&mut transport, &[0], &mut queue, 0, Duration::from_millis(10));
        assert!(matches!(
            outcome,
            PollOutcome::Failed { fault: FaultClass::CrcError, retries: 0, .. }
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn poll_once_reports_no_retry_on_illegal_address_exception() {
        use crc::{Crc, CRC_16_MODBUS};
        const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);
        let mut transport = MockTransport::new();
        let mut body = vec![DEVICE_ADDR, 0x03 | 0x80, 0x02];
        let crc = CRC16.checksum(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        transport.queue_response(&body);
        let mut queue = SampleQueue::new(8);

        let outcome = poll_once(&mut transport, &[0], &mut queue, 0, Duration::from_secs(5));
        assert!(matches!(
            outcome,
            PollOutcome::Failed { fault: FaultClass::ExceptionPermanent(0x02), retries: 0, .. }
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn sample_queue_drops_oldest_when_full() {
        let mut q = SampleQueue::new(2);
        q.push(Sample { register: 0, value: 1, timestamp_ms: 0 });
        q.push(Sample { register: 1, value: 2, timestamp_ms: 0 });
        q.push(Sample { register: 2, value: 3, timestamp_ms: 0 });
        assert_eq!(q.drops(), 1);
        let drained = q.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].register, 1);
    }

    #[test]
    fn batch_accumulator_flushes_on_selection_change() {
        let mut acc = BatchAccumulator::new(5);
        let samples_a = vec![Sample { register: 0, value: 1, timestamp_ms: 0 }];
        assert!(acc.offer(&[0], &samples_a).is_none());

        let samples_b = vec![Sample { register: 1, value: 2, timestamp_ms: 1 }];
        let flushed = acc.offer(&[1], &samples_b);
        assert!(flushed.is_some());
        let flushed = flushed.unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed.to_linear_array()[0].unwrap().register, 0);
    }

    #[test]
    fn batch_accumulator_emits_when_full() {
        let mut acc = BatchAccumulator::new(2);
        assert!(acc.offer(&[0], &[Sample { register: 0, value: 1, timestamp_ms: 0 }]).is_none());
        let flushed = acc.offer(&[0], &[Sample { register: 0, value: 2, timestamp_ms: 1 }]);
        assert!(flushed.is_some());
        assert_eq!(flushed.unwrap().len(), 2);
    }
}
