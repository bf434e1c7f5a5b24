//! Per-session symmetric keys and rotation policy.

use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Rotate after this many bytes on a session (1 GiB).
pub const ROTATION_BYTES_THRESHOLD: u64 = 1 << 30;
/// Rotate after this session age.
pub const ROTATION_AGE: Duration = Duration::from_secs(60 * 60);
/// Hard maximum session key lifetime.
pub const ROTATION_HARD_MAX: Duration = Duration::from_secs(24 * 60 * 60);
/// Maximum accepted clock skew on a key rotation message.
pub const ROTATION_MAX_SKEW: Duration = Duration::from_secs(5 * 60);

/// Symmetric keys for one direction-pair of an authenticated session.
///
/// Keys are zeroed from memory when the session ends.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub encryption_key: [u8; 32],
    pub mac_key: [u8; 32],
    #[zeroize(skip)]
    created_at: Instant,
    #[zeroize(skip)]
    bytes_transferred: u64,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("encryption_key", &"[REDACTED]")
            .field("mac_key", &"[REDACTED]")
            .field("age_secs", &self.created_at.elapsed().as_secs())
            .field("bytes_transferred", &self.bytes_transferred)
            .finish()
    }
}

impl SessionKeys {
    pub fn new(encryption_key: [u8; 32], mac_key: [u8; 32]) -> Self {
        Self {
            encryption_key,
            mac_key,
            created_at: Instant::now(),
            bytes_transferred: 0,
        }
    }

    /// Record payload bytes protected under these keys.
    pub fn record_bytes(&mut self, n: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(n);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether a rotation should be initiated: more than 1 GiB protected, or
    /// the keys are older than one hour.
    pub fn should_rotate(&self) -> bool {
        self.bytes_transferred > ROTATION_BYTES_THRESHOLD || self.age() > ROTATION_AGE
    }

    /// Whether the hard 24-hour lifetime has been exceeded. Past this point
    /// the session must rotate or close.
    pub fn past_hard_limit(&self) -> bool {
        self.age() > ROTATION_HARD_MAX
    }
}

/// Check a key-rotation timestamp (seconds since the epoch) against the
/// local clock. Rejects skew beyond ±5 minutes.
pub fn rotation_timestamp_fresh(timestamp_secs: u64) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let skew = now.abs_diff(timestamp_secs);
    skew <= ROTATION_MAX_SKEW.as_secs()
}
