//! Core types shared across the pipeline

use bytes::Bytes;
use std::time::Duration;

/// Kind of media data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Video frame data
    Video,
    /// Audio sample data
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// A raw, uncompressed media frame on its way into an encoder session.
///
/// Produced by a capturer without a timestamp; the frame handler stamps `pts`
/// from the shared clock before handing the frame to the session. Ownership
/// is transferred to the handler for the duration of one encode call.
#[derive(Clone)]
pub struct MediaFrame {
    /// Kind of media (video or audio)
    pub kind: MediaKind,

    /// Raw sample data: packed YUV420p planes for video,
    /// interleaved s16le samples for audio
    pub data: Bytes,

    /// Presentation timestamp in the stream's own tick rate.
    /// Stamped by the frame handler, not by the capturer.
    pub pts: i64,

    /// Frame width (for video only)
    pub width: Option<u32>,

    /// Frame height (for video only)
    pub height: Option<u32>,

    /// Sample rate (for audio only)
    pub sample_rate: Option<u32>,

    /// Number of channels (for audio only)
    pub channels: Option<u16>,

    /// Samples per channel (for audio only)
    pub samples: Option<usize>,
}

impl MediaFrame {
    /// Create a new raw video frame
    pub fn video(data: Bytes, width: u32, height: u32) -> Self {
        Self {
            kind: MediaKind::Video,
            data,
            pts: 0,
            width: Some(width),
            height: Some(height),
            sample_rate: None,
            channels: None,
            samples: None,
        }
    }

    /// Create a new raw audio frame
    pub fn audio(data: Bytes, sample_rate: u32, channels: u16, samples: usize) -> Self {
        Self {
            kind: MediaKind::Audio,
            data,
            pts: 0,
            width: None,
            height: None,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            samples: Some(samples),
        }
    }

    /// Get the size of the frame data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for MediaFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("MediaFrame");
        debug
            .field("kind", &self.kind)
            .field("pts", &self.pts)
            .field("size", &self.size());

        if let Some(width) = self.width {
            debug.field("width", &width);
        }
        if let Some(height) = self.height {
            debug.field("height", &height);
        }
        if let Some(sample_rate) = self.sample_rate {
            debug.field("sample_rate", &sample_rate);
        }
        if let Some(channels) = self.channels {
            debug.field("channels", &channels);
        }

        debug.finish()
    }
}

/// One compressed bitstream unit leaving an encoder session.
///
/// Created by the session, handed to the push sink, which owns it until it is
/// transmitted or shed.
#[derive(Clone)]
pub struct EncodedPacket {
    /// Kind of media (video or audio)
    pub kind: MediaKind,

    /// Compressed payload (Annex B for video, raw AAC for audio)
    pub data: Bytes,

    /// Presentation timestamp in the stream's own tick rate
    pub pts: i64,

    /// Nominal wall-clock duration of this packet, used by the sink
    /// for queue-depth accounting
    pub duration: Duration,

    /// Whether this packet carries a keyframe (video only;
    /// always false for audio)
    pub keyframe: bool,
}

impl EncodedPacket {
    /// Get the size of the packet payload in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for EncodedPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedPacket")
            .field("kind", &self.kind)
            .field("pts", &self.pts)
            .field("duration", &self.duration)
            .field("keyframe", &self.keyframe)
            .field("size", &self.size())
            .finish()
    }
}
