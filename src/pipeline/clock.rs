//! Shared publish clock for audio-video synchronization

use std::time::{Duration, Instant};

/// Video timestamps are produced in millisecond ticks, matching the
/// per-frame durations the sink accounts in.
pub const VIDEO_TICK_HZ: u32 = 1_000;

/// Publish clock giving audio and video streams a mutually consistent
/// time base.
///
/// The clock holds a single baseline instant plus one tick rate per stream
/// (audio: the sample rate; video: [`VIDEO_TICK_HZ`]). Timestamps are pure
/// projections of "time since reset" scaled into each stream's tick rate —
/// no per-call state is kept, so a stalled capture thread that resumes gets
/// correct timestamps again without drift.
///
/// # Usage contract
///
/// `reset()` must happen-before the capture threads start and never run
/// concurrently with timestamp reads; it takes `&mut self` so the borrow
/// checker enforces exactly that. Once shared (e.g. behind an `Arc`), only
/// the read-side methods remain callable.
#[derive(Debug, Clone, Copy)]
pub struct MediaClock {
    base: Instant,
    audio_rate: u32,
    video_rate: u32,
}

impl MediaClock {
    /// Create a clock with its baseline set to now.
    pub fn start(audio_rate: u32, video_rate: u32) -> Self {
        Self {
            base: Instant::now(),
            audio_rate,
            video_rate,
        }
    }

    /// Establish a fresh baseline instant.
    pub fn reset(&mut self) {
        self.base = Instant::now();
    }

    /// Elapsed wall-clock time since the last reset.
    pub fn elapsed(&self) -> Duration {
        self.base.elapsed()
    }

    /// Current audio presentation timestamp, in sample ticks.
    pub fn audio_pts(&self) -> i64 {
        self.project(self.audio_rate)
    }

    /// Current video presentation timestamp, in [`VIDEO_TICK_HZ`] ticks.
    pub fn video_pts(&self) -> i64 {
        self.project(self.video_rate)
    }

    fn project(&self, rate: u32) -> i64 {
        let elapsed = self.base.elapsed().as_micros() as i128;
        (elapsed * rate as i128 / 1_000_000) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pts_monotonic() {
        let clock = MediaClock::start(48_000, VIDEO_TICK_HZ);

        let a1 = clock.audio_pts();
        let v1 = clock.video_pts();
        thread::sleep(Duration::from_millis(15));
        let a2 = clock.audio_pts();
        let v2 = clock.video_pts();

        assert!(a2 > a1, "audio pts must advance: {} -> {}", a1, a2);
        assert!(v2 > v1, "video pts must advance: {} -> {}", v1, v2);
    }

    #[test]
    fn test_streams_share_baseline() {
        let clock = MediaClock::start(48_000, VIDEO_TICK_HZ);
        thread::sleep(Duration::from_millis(20));

        // Both projections are derived from the same elapsed time, so
        // converting back to seconds must agree within a small tolerance.
        let audio_secs = clock.audio_pts() as f64 / 48_000.0;
        let video_secs = clock.video_pts() as f64 / VIDEO_TICK_HZ as f64;
        assert!(
            (audio_secs - video_secs).abs() < 0.005,
            "audio {}s vs video {}s",
            audio_secs,
            video_secs
        );
    }

    #[test]
    fn test_reset_rebases() {
        let mut clock = MediaClock::start(48_000, VIDEO_TICK_HZ);
        thread::sleep(Duration::from_millis(20));
        let before = clock.video_pts();
        clock.reset();
        let after = clock.video_pts();

        assert!(before >= 20);
        assert!(after < before, "reset must rebase: {} -> {}", before, after);
    }

    #[test]
    fn test_video_tick_rate_is_milliseconds() {
        let clock = MediaClock::start(48_000, VIDEO_TICK_HZ);
        thread::sleep(Duration::from_millis(40));

        let pts = clock.video_pts();
        let elapsed_ms = clock.elapsed().as_millis() as i64;
        assert!((pts - elapsed_ms).abs() <= 1);
    }
}
