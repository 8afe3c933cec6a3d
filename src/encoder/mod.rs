//! Encoder sessions wrapping the FFmpeg codec engines
//!
//! A session turns the engine's asynchronous feed/drain protocol into a
//! pull-style call: feed one frame (or none, to flush), get back at most one
//! compressed unit. Callers branch on the tagged [`EncodePoll`] result
//! instead of engine-specific error constants.

pub mod audio;
pub mod video;

pub use audio::AudioSession;
pub use video::VideoSession;

use crate::pipeline::types::EncodedPacket;

/// Outcome of one feed+drain cycle against the codec engine.
#[derive(Debug)]
pub enum EncodePoll {
    /// A compressed unit is ready; more may follow on later calls.
    Packet(EncodedPacket),

    /// Steady-state condition, not an error: the engine needs another frame
    /// before it can emit output, or needs its output drained before it
    /// accepts more input (`input_saturated`). The caller simply continues
    /// with the next frame.
    Retry {
        /// The engine refused the input frame this cycle.
        input_saturated: bool,
    },

    /// The engine was flushed and will produce no further output. Terminal.
    End,
}

/// Error arm of an encode call.
#[derive(Debug)]
pub enum EncodeError {
    /// The raw frame does not match the size the session was opened with.
    /// Recoverable: the session stays usable, the frame is skipped.
    BufferMismatch { expected: usize, got: usize },

    /// Unrecoverable engine failure. The session is faulted and must be
    /// closed and reopened to continue.
    Fatal(anyhow::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::BufferMismatch { expected, got } => {
                write!(f, "frame buffer size mismatch: expected {expected}, got {got}")
            }
            EncodeError::Fatal(e) => write!(f, "fatal encoder error: {e}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Lifecycle of an encoder session.
///
/// `Ready` loops on itself in steady state; a null frame moves the session
/// to `Draining` and the last drained packet to `Ended`. `Faulted` is
/// reachable from any state on a fatal engine error. There is no transition
/// out of `Ended` or `Faulted` except closing and opening a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Open and accepting frames
    Ready,
    /// A flush was requested; the engine is emitting its tail
    Draining,
    /// Flushed and fully drained
    Ended,
    /// Hit a fatal engine error
    Faulted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Faulted)
    }
}
