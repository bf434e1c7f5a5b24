//! Token-bucket bandwidth limiting.
//!
//! Tokens are bytes. The bucket refills continuously at the configured rate
//! and caps at the bucket capacity, so short bursts up to the capacity are
//! allowed while the sustained rate stays bounded. Pending send requests
//! queue by priority, FIFO within a priority level.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// Default sustained rate: 1 MB/s.
pub const DEFAULT_RATE: u64 = 1024 * 1024;
/// Default bucket capacity: 64 KB.
pub const DEFAULT_CAPACITY: u64 = 64 * 1024;

/// Send priority; `High` drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    priority: Priority,
    bytes: u64,
    /// FIFO tiebreaker within a priority level.
    seq: u64,
}

impl PartialEq for PendingRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority.rank() == other.priority.rank() && self.seq == other.seq
    }
}

impl Eq for PendingRequest {}

impl Ord for PendingRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: "greater" means lower rank, then lower seq
        other
            .priority
            .rank()
            .cmp(&self.priority.rank())
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct BandwidthLimiter {
    max_bandwidth: u64,
    bucket_capacity: u64,
    available_tokens: u64,
    last_refill: Instant,
    pending: BinaryHeap<PendingRequest>,
    next_seq: u64,
}

impl Default for BandwidthLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_CAPACITY)
    }
}

impl BandwidthLimiter {
    pub fn new(bytes_per_second: u64, bucket_capacity: u64) -> Self {
        Self {
            max_bandwidth: bytes_per_second,
            bucket_capacity,
            available_tokens: bucket_capacity,
            last_refill: Instant::now(),
            pending: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn set_max_bandwidth(&mut self, bytes_per_second: u64) {
        self.max_bandwidth = bytes_per_second;
    }

    pub fn set_bucket_capacity(&mut self, capacity: u64) {
        self.bucket_capacity = capacity;
        self.available_tokens = self.available_tokens.min(capacity);
    }

    fn refill(&mut self) {
        let elapsed_ms = self.last_refill.elapsed().as_millis() as u64;
        if elapsed_ms > 0 {
            let tokens_to_add = self.max_bandwidth.saturating_mul(elapsed_ms) / 1000;
            self.available_tokens =
                (self.available_tokens.saturating_add(tokens_to_add)).min(self.bucket_capacity);
            self.last_refill = Instant::now();
        }
    }

    /// Whether `bytes` can be sent right now.
    pub fn can_send(&mut self, bytes: u64) -> bool {
        self.refill();
        self.available_tokens >= bytes
    }

    /// Consume tokens for a send. No-op if the bucket lacks the tokens;
    /// callers gate on [`can_send`](Self::can_send) first.
    pub fn consume(&mut self, bytes: u64) {
        if self.available_tokens >= bytes {
            self.available_tokens -= bytes;
        }
    }

    pub fn available_tokens(&mut self) -> u64 {
        self.refill();
        self.available_tokens
    }

    /// Queue a send for later processing.
    pub fn add_request(&mut self, priority: Priority, bytes: u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(PendingRequest {
            priority,
            bytes,
            seq,
        });
    }

    /// Drain queued sends in priority order while tokens last. Returns the
    /// requests released for sending.
    pub fn process_pending(&mut self) -> Vec<(Priority, u64)> {
        self.refill();

        let mut released = Vec::new();
        while let Some(front) = self.pending.peek() {
            if self.available_tokens < front.bytes {
                break;
            }
            let request = self.pending.pop().expect("peeked entry exists");
            self.available_tokens -= request.bytes;
            released.push((request.priority, request.bytes));
        }
        released
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
