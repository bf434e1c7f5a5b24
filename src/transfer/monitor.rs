//! Transfer performance statistics.
//!
//! Per session, a rolling 30-second window of (timestamp, bytes) samples
//! yields the current speed (bytes in the last second); the average speed is
//! total bytes over total elapsed time. The ETA uses the current speed when
//! available, falling back to the average, and reports zero when complete or
//! when the speed is unknown.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Sample retention window.
const HISTORY_WINDOW: Duration = Duration::from_secs(30);

/// Point-in-time statistics for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub session_id: String,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub current_speed_bps: u64,
    pub average_speed_bps: u64,
    pub eta_ms: u64,
}

impl SessionStats {
    pub fn percentage_complete(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
    }
}

#[derive(Debug)]
struct SessionData {
    total_bytes: u64,
    bytes_transferred: u64,
    start_time: Instant,
    history: VecDeque<(Instant, u64)>,
}

impl SessionData {
    fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            bytes_transferred: 0,
            start_time: Instant::now(),
            history: VecDeque::new(),
        }
    }

    fn prune_history(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(HISTORY_WINDOW) else {
            return;
        };
        while let Some(&(timestamp, _)) = self.history.front() {
            if timestamp < cutoff {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes observed within the last second.
    fn current_speed_bps(&self) -> u64 {
        let one_second_ago = Instant::now().checked_sub(Duration::from_secs(1));
        self.history
            .iter()
            .filter(|(timestamp, _)| match one_second_ago {
                Some(cutoff) => *timestamp >= cutoff,
                None => true,
            })
            .map(|(_, bytes)| bytes)
            .sum()
    }

    fn average_speed_bps(&self) -> u64 {
        let elapsed_ms = self.start_time.elapsed().as_millis() as u64;
        if elapsed_ms == 0 {
            return 0;
        }
        self.bytes_transferred.saturating_mul(1000) / elapsed_ms
    }

    fn eta_ms(&self) -> u64 {
        if self.bytes_transferred >= self.total_bytes {
            return 0;
        }
        let remaining = self.total_bytes - self.bytes_transferred;
        let speed = match self.current_speed_bps() {
            0 => self.average_speed_bps(),
            current => current,
        };
        if speed == 0 {
            return 0;
        }
        remaining.saturating_mul(1000) / speed
    }
}

#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    sessions: HashMap<String, SessionData>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_session(&mut self, session_id: &str, total_bytes: u64) {
        self.sessions
            .insert(session_id.to_string(), SessionData::new(total_bytes));
    }

    pub fn end_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn on_bytes_transferred(&mut self, session_id: &str, bytes: u64) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.bytes_transferred = session.bytes_transferred.saturating_add(bytes);
            session.history.push_back((Instant::now(), bytes));
            session.prune_history();
        }
    }

    pub fn session_stats(&self, session_id: &str) -> SessionStats {
        match self.sessions.get(session_id) {
            Some(session) => SessionStats {
                session_id: session_id.to_string(),
                total_bytes: session.total_bytes,
                bytes_transferred: session.bytes_transferred,
                current_speed_bps: session.current_speed_bps(),
                average_speed_bps: session.average_speed_bps(),
                eta_ms: session.eta_ms(),
            },
            None => SessionStats {
                session_id: session_id.to_string(),
                total_bytes: 0,
                bytes_transferred: 0,
                current_speed_bps: 0,
                average_speed_bps: 0,
                eta_ms: 0,
            },
        }
    }

    pub fn all_session_stats(&self) -> Vec<SessionStats> {
        self.sessions
            .keys()
            .map(|id| self.session_stats(id))
            .collect()
    }

    pub fn total_bytes_transferred(&self) -> u64 {
        self.sessions.values().map(|s| s.bytes_transferred).sum()
    }

    pub fn current_global_speed(&self) -> u64 {
        self.sessions.values().map(|s| s.current_speed_bps()).sum()
    }
}
