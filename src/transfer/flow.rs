//! Per-session congestion control.
//!
//! TCP-style windowing over chunk requests: slow start doubles the window
//! (one increment per ACK) until the threshold, then congestion avoidance
//! grows it by one per full window of ACKs. A timeout halves the threshold,
//! collapses the window to one, and re-enters slow start. The retransmit
//! timeout follows the standard estimator: `RTT + 4 * RTTvar`, floored at
//! 100 ms, with an EWMA (`alpha = 0.125`) over RTT samples.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Initial slow-start threshold.
const INITIAL_SSTHRESH: u32 = 1024;
/// EWMA weight for RTT samples.
const RTT_ALPHA: f64 = 0.125;
/// Lower bound on the computed timeout.
const MIN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct FlowController {
    congestion_window: u32,
    slow_start_threshold: u32,
    in_slow_start: bool,
    /// ACKs accumulated toward the next linear window increment.
    ack_credit: u32,
    estimated_rtt: Duration,
    rtt_variance: Duration,
    min_rtt: Duration,
    max_requests_per_second: u32,
    recent_requests: VecDeque<Instant>,
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowController {
    pub fn new() -> Self {
        Self {
            congestion_window: 1,
            slow_start_threshold: INITIAL_SSTHRESH,
            in_slow_start: true,
            ack_credit: 0,
            estimated_rtt: Duration::from_millis(100),
            rtt_variance: Duration::from_millis(50),
            min_rtt: Duration::from_millis(u64::MAX / 1000),
            max_requests_per_second: 1000,
            recent_requests: VecDeque::new(),
        }
    }

    /// Current request window; never below 1.
    pub fn window_size(&self) -> u32 {
        self.congestion_window.max(1)
    }

    pub fn in_slow_start(&self) -> bool {
        self.in_slow_start
    }

    pub fn slow_start_threshold(&self) -> u32 {
        self.slow_start_threshold
    }

    /// An acknowledged chunk grows the window: exponentially in slow start,
    /// linearly (one per full window of ACKs) afterwards.
    pub fn on_ack_received(&mut self) {
        if self.in_slow_start {
            self.congestion_window += 1;
            if self.congestion_window >= self.slow_start_threshold {
                self.in_slow_start = false;
                self.ack_credit = 0;
            }
        } else {
            self.ack_credit += 1;
            if self.ack_credit >= self.congestion_window {
                self.congestion_window += 1;
                self.ack_credit = 0;
            }
        }
    }

    /// A timeout: multiplicative decrease and back to slow start.
    pub fn on_timeout(&mut self) {
        self.slow_start_threshold = (self.congestion_window / 2).max(2);
        self.congestion_window = 1;
        self.in_slow_start = true;
        self.ack_credit = 0;
    }

    /// Fold an RTT sample into the estimator.
    pub fn update_rtt(&mut self, rtt: Duration) {
        self.min_rtt = self.min_rtt.min(rtt);

        let sample_ms = rtt.as_millis() as f64;
        let estimate_ms = self.estimated_rtt.as_millis() as f64;
        let variance_ms = self.rtt_variance.as_millis() as f64;

        let new_variance = (1.0 - RTT_ALPHA) * variance_ms + RTT_ALPHA * (sample_ms - estimate_ms).abs();
        let new_estimate = (1.0 - RTT_ALPHA) * estimate_ms + RTT_ALPHA * sample_ms;

        self.rtt_variance = Duration::from_millis(new_variance as u64);
        self.estimated_rtt = Duration::from_millis(new_estimate as u64);
    }

    /// Retransmit timeout: `RTT + 4 * RTTvar`, floored at 100 ms.
    pub fn timeout(&self) -> Duration {
        (self.estimated_rtt + 4 * self.rtt_variance).max(MIN_TIMEOUT)
    }

    pub fn estimated_rtt(&self) -> Duration {
        self.estimated_rtt
    }

    pub fn set_max_requests_per_second(&mut self, max_rate: u32) {
        self.max_requests_per_second = max_rate;
    }

    /// Whether the per-second request rate limit allows another request.
    pub fn can_send_request(&mut self) -> bool {
        self.prune_old_requests();
        (self.recent_requests.len() as u32) < self.max_requests_per_second
    }

    pub fn on_request_sent(&mut self) {
        self.recent_requests.push_back(Instant::now());
    }

    fn prune_old_requests(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(Duration::from_secs(1)) else {
            return;
        };
        while let Some(&front) = self.recent_requests.front() {
            if front < cutoff {
                self.recent_requests.pop_front();
            } else {
                break;
            }
        }
    }
}
