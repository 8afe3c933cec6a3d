//! Health counters for the push pipeline

use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for the push pipeline
///
/// Tracks counters shared between the capture callbacks, the transmit task
/// and the control thread. All fields use atomic operations for thread-safe
/// access.
pub struct PipelineHealth {
    /// Number of frames dropped due to backpressure or a degraded session
    pub frame_drops: AtomicU64,

    /// Number of encode failures (fatal or skipped frames)
    pub encode_failures: AtomicU64,

    /// Number of network errors
    pub network_errors: AtomicU64,

    /// Number of packets successfully transmitted
    pub packets_sent: AtomicU64,

    /// Total bytes of payload transmitted
    pub bytes_sent: AtomicU64,

    /// Number of keyframes transmitted
    pub keyframes_sent: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            frame_drops: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            keyframes_sent: AtomicU64::new(0),
        }
    }

    /// Record a dropped frame or shed packet
    pub fn record_drop(&self) {
        self.frame_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an encode failure
    pub fn record_encode_failure(&self) {
        self.encode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a network error
    pub fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successfully transmitted packet
    pub fn record_sent(&self, size: usize, is_keyframe: bool) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops.load(Ordering::Relaxed)
    }

    pub fn encode_failures(&self) -> u64 {
        self.encode_failures.load(Ordering::Relaxed)
    }

    pub fn network_errors(&self) -> u64 {
        self.network_errors.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn keyframes_sent(&self) -> u64 {
        self.keyframes_sent.load(Ordering::Relaxed)
    }

    /// Get a snapshot of the counters
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            packets_sent: self.packets_sent(),
            bytes_sent: self.bytes_sent(),
            keyframes_sent: self.keyframes_sent(),
            frame_drops: self.frame_drops(),
            encode_failures: self.encode_failures(),
            network_errors: self.network_errors(),
        }
    }
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub keyframes_sent: u64,
    pub frame_drops: u64,
    pub encode_failures: u64,
    pub network_errors: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} packets ({} bytes, {} keyframes) sent, {} drops, {} encode failures, {} network errors",
            self.packets_sent,
            self.bytes_sent,
            self.keyframes_sent,
            self.frame_drops,
            self.encode_failures,
            self.network_errors
        )
    }
}
