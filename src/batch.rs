//! Sample Batch and Compressed Packet Ring.
//!
//! [`SampleBatch`] accumulates register samples until either it reaches its
//! configured capacity (default 5, hard upper bound 20) or the polling
//! pipeline decides to flush early (e.g. a register-selection change).
//! [`CompressedRing`] holds the resulting [`CompressedPacket`]s until the
//! uploader drains them, overwriting the oldest packet when full — the same
//! fixed-buffer accumulate/flush shape as [`crate::rpc::chunked::ChunkReassembler`],
//! generalized to a ring instead of a single reassembly slot.

use crate::error::Error;

/// One register reading captured at a point in time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub register: u16,
    pub value: u16,
    pub timestamp_ms: u64,
}

/// Hard upper bound on samples a single batch may ever hold.
pub const MAX_BATCH_CAPACITY: usize = 20;
/// Default configured batch capacity.
pub const DEFAULT_BATCH_CAPACITY: usize = 5;

/// Fixed-capacity accumulator for samples awaiting compression.
pub struct SampleBatch {
    samples: [Option<Sample>; MAX_BATCH_CAPACITY],
    len: usize,
    capacity: usize,
}

impl SampleBatch {
    /// Create a batch with the given logical capacity (clamped to
    /// `1..=MAX_BATCH_CAPACITY`).
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: [None; MAX_BATCH_CAPACITY],
            len: 0,
            capacity: capacity.clamp(1, MAX_BATCH_CAPACITY),
        }
    }

    /// Push a sample. Fails with `Error::BufferOverflow` if already full.
    pub fn push(&mut self, sample: Sample) -> Result<(), Error> {
        if self.is_full() {
            return Err(Error::BufferOverflow);
        }
        self.samples[self.len] = Some(sample);
        self.len += 1;
        Ok(())
    }

    /// Whether the batch has reached its configured capacity.
    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Configured capacity (not the hard upper bound).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Flatten the batch into an ordinary slice view, insertion order.
    pub fn to_linear_array(&self) -> &[Option<Sample>] {
        &self.samples[..self.len]
    }

    /// Clear the batch back to empty, keeping its configured capacity.
    pub fn reset(&mut self) {
        self.samples = [None; MAX_BATCH_CAPACITY];
        self.len = 0;
    }
}

/// A compressed blob ready for the Security Envelope and upload. Never
/// exceeds 512 bytes (enforced by the Adaptive Compression Engine's
/// hard-cap, not re-checked here).
#[derive(Debug, Clone)]
pub struct CompressedPacket {
    pub codec_id: u8,
    pub bytes: Vec<u8>,
}

/// Maximum number of packets the ring will hold before overwriting the
/// oldest.
pub const RING_CAPACITY: usize = 32;

/// Ring buffer of compressed packets awaiting upload. Overwrites the oldest
/// packet on push when full, matching the sample batch's reset-not-error
/// posture under backpressure.
pub struct CompressedRing {
    slots: [Option<CompressedPacket>; RING_CAPACITY],
    head: usize,
    len: usize,
}

impl CompressedRing {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            head: 0,
            len: 0,
        }
    }

    /// Push a packet, overwriting the oldest entry if the ring is full.
    /// Returns `true` if an existing packet was overwritten.
    pub fn push(&mut self, packet: CompressedPacket) -> bool {
        let overwrote = self.len == RING_CAPACITY;
        let idx = (self.head + self.len) % RING_CAPACITY;
        if overwrote {
            self.head = (self.head + 1) % RING_CAPACITY;
        } else {
            self.len += 1;
        }
        self.slots[idx] = Some(packet);
        overwrote
    }

    /// Drain all packets in insertion order (oldest first), leaving the
    /// ring empty.
    pub fn drain_all(&mut self) -> Vec<CompressedPacket> {
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            let idx = (self.head + i) % RING_CAPACITY;
            if let Some(p) = self.slots[idx].take() {
                out.push(p);
            }
        }
        self.head = 0;
        self.len = 0;
        out
    }

    /// Push packets back onto the ring, oldest first, as the uploader does
    /// when an upload attempt fails after having drained the ring.
    pub fn push_back_all(&mut self, packets: Vec<CompressedPacket>) {
        for p in packets {
            self.push(p);
        }
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for CompressedRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(register: u16, value: u16) -> Sample {
        Sample { register, value, timestamp_ms: 0 }
    }

    #[test]
    fn batch_of_one_is_not_full_at_default_capacity() {
        let mut b = SampleBatch::new(DEFAULT_BATCH_CAPACITY);
        b.push(sample(0, 1)).unwrap();
        assert!(!b.is_full());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn batch_at_capacity_is_full_and_rejects_further_pushes() {
        let mut b = SampleBatch::new(3);
        for i in 0..3 {
            b.push(sample(i, i)).unwrap();
        }
        assert!(b.is_full());
        assert!(matches!(b.push(sample(99, 99)), Err(Error::BufferOverflow)));
    }

    #[test]
    fn capacity_clamped_to_hard_upper_bound() {
        let b = SampleBatch::new(999);
        assert_eq!(b.capacity(), MAX_BATCH_CAPACITY);
    }

    #[test]
    fn to_linear_array_preserves_insertion_order() {
        let mut b = SampleBatch::new(5);
        b.push(sample(1, 10)).unwrap();
        b.push(sample(2, 20)).unwrap();
        let arr = b.to_linear_array();
        assert_eq!(arr[0].unwrap().register, 1);
        assert_eq!(arr[1].unwrap().register, 2);
    }

    #[test]
    fn reset_clears_batch() {
        let mut b = SampleBatch::new(5);
        b.push(sample(1, 10)).unwrap();
        b.reset();
        assert!(b.is_empty());
        assert_eq!(b.len(), 0);
    }

    #[test]
    fn ring_drain_all_preserves_fifo_order() {
        let mut ring = CompressedRing::new();
        ring.push(CompressedPacket { codec_id: 0, bytes: vec![1] });
        ring.push(CompressedPacket { codec_id: 0, bytes: vec![2] });
        ring.push(CompressedPacket { codec_id: 0, bytes: vec![3] });
        let drained = ring.drain_all();
        assert_eq!(drained.iter().map(|p| p.bytes[0]).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(ring.is_empty());
    }

    #[test]
    fn ring_at_capacity_overwrites_oldest() {
        let mut ring = CompressedRing::new();
        for i in 0..RING_CAPACITY {
            ring.push(CompressedPacket { codec_id: 0, bytes: vec![i as u8] });
        }
        assert_eq!(ring.size(), RING_CAPACITY);
        let overwrote = ring.push(CompressedPacket { codec_id: 0, bytes: vec![0xFF] });
        assert!(overwrote);
        assert_eq!(ring.size(), RING_CAPACITY);
        let drained = ring.drain_all();
        assert_eq!(drained[0].bytes[0], 1); // oldest (0) was evicted
        assert_eq!(*drained.last().unwrap().bytes.last().unwrap(), 0xFF);
    }

    #[test]
    fn push_back_all_restores_oldest_first_ordering() {
        let mut ring = CompressedRing::new();
        ring.push(CompressedPacket { codec_id: 0, bytes: vec![1] });
        ring.push(CompressedPacket { codec_id: 0, bytes: vec![2] });
        let drained = ring.drain_all();
        ring.push_back_all(drained);
        assert_eq!(ring.size(), 2);
        let redrained = ring.drain_all();
        assert_eq!(redrained[0].bytes[0], 1);
    }
}
