//! Frame capture
//!
//! Capturers acquire raw frames on a dedicated schedule and deliver them
//! synchronously to a registered [`FrameSink`] on the capture thread. The
//! handler may do bounded encode work but must never wait on network I/O —
//! the push sink takes over from there without blocking.

pub mod audio;
pub mod video;

pub use audio::{AudioCapturer, AudioSource};
pub use video::{VideoCapturer, VideoSource};

use crate::pipeline::types::MediaFrame;

/// Receiver of captured frames.
///
/// `on_frame` executes on the capturer's own thread. Implementations are
/// exchanged for test doubles in unit tests, which is why delivery goes
/// through this trait rather than a bare function pointer.
pub trait FrameSink: Send {
    fn on_frame(&mut self, frame: MediaFrame);
}

impl<F: FnMut(MediaFrame) + Send> FrameSink for F {
    fn on_frame(&mut self, frame: MediaFrame) {
        self(frame)
    }
}
