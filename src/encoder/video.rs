//! H.264 video encoder session

use ac_ffmpeg::codec::video::{VideoEncoder, VideoFrame, VideoFrameMut, frame::get_pixel_format};
use ac_ffmpeg::codec::{CodecError, CodecParameters, Encoder};
use ac_ffmpeg::time::{TimeBase, Timestamp};
use anyhow::anyhow;
use bytes::Bytes;
use std::time::Duration;

use crate::encoder::{EncodeError, EncodePoll, SessionState};
use crate::pipeline::clock::VIDEO_TICK_HZ;
use crate::pipeline::types::{EncodedPacket, MediaFrame, MediaKind};

/// Annex B start marker delimiting the out-of-band parameter records.
const START_MARKER: [u8; 4] = [0, 0, 0, 1];

/// Encoder fallback chain: the software encoder first (it matches the
/// low-latency tuning the pipeline is built around), then hardware
/// encoders where present.
const ENCODER_CHAIN: &[(&str, &[(&str, &str)])] = &[
    (
        "libx264",
        &[
            ("preset", "ultrafast"),
            ("tune", "zerolatency"),
            ("profile", "baseline"),
            ("qmin", "10"),
            ("qmax", "51"),
        ],
    ),
    (
        "h264_nvenc",
        &[("preset", "p1"), ("tune", "ll"), ("zerolatency", "1")],
    ),
    (
        "h264_qsv",
        &[("preset", "veryfast"), ("async_depth", "1")],
    ),
];

/// Immutable configuration of a video session. Changing any parameter
/// requires closing the session and opening a new one.
#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u64,
    pub gop: u32,
    pub b_frames: u32,
    /// Specific engine to use; the fallback chain is tried when unset.
    pub codec: Option<String>,
}

pub struct VideoSession {
    encoder: Option<VideoEncoder>,
    state: SessionState,
    time_base: TimeBase,
    width: usize,
    height: usize,
    /// Expected YUV420p input size: w*h luma + 2 quarter-size chroma planes
    frame_size: usize,
    packet_duration: Duration,
    sps: Bytes,
    pps: Bytes,
    codec_name: String,
    /// Last pushed frame, kept for buffer reuse once the engine releases it
    spare: Option<VideoFrame>,
}

impl VideoSession {
    /// Allocate and configure the engine, requesting global headers, and
    /// extract the two out-of-band parameter records from its header blob.
    ///
    /// Fails when the dimensions are unset or non-even, or when no engine
    /// in the chain accepts the configuration.
    pub fn open(config: &VideoConfig) -> anyhow::Result<Self> {
        if config.width == 0 || config.width % 2 != 0 {
            return Err(anyhow!("unsupported video width: {}", config.width));
        }
        if config.height == 0 || config.height % 2 != 0 {
            return Err(anyhow!("unsupported video height: {}", config.height));
        }
        if config.fps == 0 {
            return Err(anyhow!("video fps must be positive"));
        }

        let time_base = TimeBase::new(1, VIDEO_TICK_HZ as _);
        let (encoder, codec_name) = Self::create_engine(config, time_base)?;

        let params = CodecParameters::from(encoder.codec_parameters());
        let extradata = params
            .extradata()
            .filter(|data| !data.is_empty())
            .ok_or_else(|| anyhow!("encoder {codec_name} produced no out-of-band headers"))?;
        let (sps, pps) = split_parameter_sets(extradata)?;

        log::info!(
            "video session open: {}x{}@{} via {}, sps {} bytes, pps {} bytes",
            config.width,
            config.height,
            config.fps,
            codec_name,
            sps.len(),
            pps.len()
        );

        let width = config.width as usize;
        let height = config.height as usize;
        Ok(Self {
            encoder: Some(encoder),
            state: SessionState::Ready,
            time_base,
            width,
            height,
            frame_size: width * height * 3 / 2,
            packet_duration: Duration::from_millis((1000 / config.fps) as u64),
            sps,
            pps,
            codec_name,
            spare: None,
        })
    }

    fn create_engine(
        config: &VideoConfig,
        time_base: TimeBase,
    ) -> anyhow::Result<(VideoEncoder, String)> {
        let chain: Vec<(&str, &[(&str, &str)])> = match &config.codec {
            Some(name) => match ENCODER_CHAIN.iter().find(|(codec, _)| *codec == name.as_str()) {
                Some(entry) => vec![*entry],
                // Unknown name: try it with no tuning options.
                None => vec![(name.as_str(), &[])],
            },
            None => ENCODER_CHAIN.to_vec(),
        };

        let pixel_format = get_pixel_format("yuv420p");

        for (codec, options) in chain {
            let mut builder = match VideoEncoder::builder(codec) {
                Ok(b) => b,
                Err(e) => {
                    log::debug!("encoder {} not available, skipping: {}", codec, e);
                    continue;
                }
            };
            builder = builder
                .pixel_format(pixel_format)
                .width(config.width as usize)
                .height(config.height as usize)
                .time_base(time_base)
                // Parameter sets must land in the header blob, not the stream.
                .set_option("flags", "+global_header")
                .set_option("b", config.bitrate.to_string())
                .set_option("g", config.gop.to_string())
                .set_option("bf", config.b_frames.to_string());
            for (k, v) in options {
                builder = builder.set_option(k, v);
            }
            match builder.build() {
                Ok(enc) => return Ok((enc, codec.to_string())),
                Err(e) => {
                    log::debug!("encoder {} failed to initialize: {}", codec, e);
                    continue;
                }
            }
        }

        Err(anyhow!("no usable H.264 encoder found"))
    }

    /// The extracted out-of-band parameter records, without start markers.
    pub fn parameter_sets(&self) -> (Bytes, Bytes) {
        (self.sps.clone(), self.pps.clone())
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn packet_duration(&self) -> Duration {
        self.packet_duration
    }

    /// Feed one raw YUV420p frame (or none, to begin a flush) and attempt to
    /// drain one compressed unit.
    pub fn encode(
        &mut self,
        frame: Option<&MediaFrame>,
        pts: i64,
    ) -> Result<EncodePoll, EncodeError> {
        match self.state {
            SessionState::Ended => return Ok(EncodePoll::End),
            SessionState::Faulted => {
                return Err(EncodeError::Fatal(anyhow!("video session is faulted")));
            }
            _ => {}
        }

        let mut input_saturated = false;

        match frame {
            Some(raw) => {
                if self.state == SessionState::Draining {
                    self.state = SessionState::Faulted;
                    return Err(EncodeError::Fatal(anyhow!(
                        "cannot feed frames into a draining session"
                    )));
                }
                if raw.data.len() != self.frame_size {
                    return Err(EncodeError::BufferMismatch {
                        expected: self.frame_size,
                        got: raw.data.len(),
                    });
                }

                let engine_frame = self.fill_frame(&raw.data, pts);
                let encoder = self.engine_mut()?;
                match encoder.try_push(engine_frame.clone()) {
                    Ok(()) => self.spare = Some(engine_frame),
                    Err(CodecError::Again(_)) => input_saturated = true,
                    Err(CodecError::Error(e)) => return Err(self.fault(e.into())),
                }
            }
            // The engine accepts the flush exactly once; while draining we
            // only pull.
            None if self.state == SessionState::Ready => {
                let encoder = self.engine_mut()?;
                match encoder.try_flush() {
                    Ok(()) => self.state = SessionState::Draining,
                    // Output must be drained before the flush is accepted;
                    // the next null-frame call retries it.
                    Err(CodecError::Again(_)) => input_saturated = true,
                    Err(CodecError::Error(e)) => return Err(self.fault(e.into())),
                }
            }
            None => {}
        }

        let encoder = self.engine_mut()?;
        match encoder.take() {
            Ok(Some(packet)) => {
                let data = Bytes::copy_from_slice(packet.data());
                let keyframe = contains_idr(&data);
                Ok(EncodePoll::Packet(EncodedPacket {
                    kind: MediaKind::Video,
                    data,
                    pts,
                    duration: self.packet_duration,
                    keyframe,
                }))
            }
            Ok(None) => {
                if self.state == SessionState::Draining {
                    self.state = SessionState::Ended;
                    Ok(EncodePoll::End)
                } else {
                    Ok(EncodePoll::Retry { input_saturated })
                }
            }
            Err(e) => Err(self.fault(e.into())),
        }
    }

    /// Release the engine. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.encoder.take().is_some() {
            log::info!("video session closed ({})", self.codec_name);
        }
        self.spare = None;
        if !self.state.is_terminal() {
            self.state = SessionState::Ended;
        }
    }

    fn engine_mut(&mut self) -> Result<&mut VideoEncoder, EncodeError> {
        self.encoder
            .as_mut()
            .ok_or_else(|| EncodeError::Fatal(anyhow!("video session is closed")))
    }

    fn fault(&mut self, e: anyhow::Error) -> EncodeError {
        self.state = SessionState::Faulted;
        EncodeError::Fatal(e)
    }

    /// Copy packed YUV420p planes into an engine frame, reusing the previous
    /// frame's buffer when the engine has released it.
    fn fill_frame(&mut self, data: &[u8], pts: i64) -> VideoFrame {
        let mut frame = match self.spare.take().map(|f| f.try_into_mut()) {
            Some(Ok(frame)) => frame,
            _ => VideoFrameMut::black(get_pixel_format("yuv420p"), self.width, self.height)
                .with_time_base(self.time_base),
        };
        frame = frame.with_pts(Timestamp::new(pts, self.time_base));

        let (w, h) = (self.width, self.height);
        let (cw, ch) = (w / 2, h / 2);
        let y = &data[..w * h];
        let u = &data[w * h..w * h + cw * ch];
        let v = &data[w * h + cw * ch..];

        {
            let mut planes = frame.planes_mut();
            write_plane(y, w, h, planes[0].data_mut());
            write_plane(u, cw, ch, planes[1].data_mut());
            write_plane(v, cw, ch, planes[2].data_mut());
        }

        frame.freeze()
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copy a tightly packed plane into an engine plane whose rows may carry
/// stride padding.
fn write_plane(source: &[u8], width: usize, rows: usize, destination: &mut [u8]) {
    let dst_stride = destination.len() / rows;
    if dst_stride == width {
        destination[..width * rows].copy_from_slice(&source[..width * rows]);
        return;
    }

    let copy = width.min(dst_stride);
    for r in 0..rows {
        destination[r * dst_stride..r * dst_stride + copy]
            .copy_from_slice(&source[r * width..r * width + copy]);
    }
}

/// Split an out-of-band header blob of the form
/// `00 00 00 01 <first record> 00 00 00 01 <second record>`
/// into its two parameter records.
pub fn split_parameter_sets(extradata: &[u8]) -> anyhow::Result<(Bytes, Bytes)> {
    let first = find_marker(extradata, 0)
        .ok_or_else(|| anyhow!("header blob carries no start marker"))?;
    let body = first + START_MARKER.len();
    let second = find_marker(extradata, body)
        .ok_or_else(|| anyhow!("header blob carries a single parameter record"))?;

    let sps = &extradata[body..second];
    let pps = &extradata[second + START_MARKER.len()..];
    if sps.is_empty() || pps.is_empty() {
        return Err(anyhow!("empty parameter record in header blob"));
    }

    Ok((Bytes::copy_from_slice(sps), Bytes::copy_from_slice(pps)))
}

fn find_marker(data: &[u8], from: usize) -> Option<usize> {
    if data.len() < from + START_MARKER.len() {
        return None;
    }
    (from..=data.len() - START_MARKER.len()).find(|&i| data[i..i + 4] == START_MARKER)
}

/// Check if H.264 Annex B data contains an IDR NAL unit (type 5)
pub(crate) fn contains_idr(data: &[u8]) -> bool {
    let mut i = 0;
    while i + 4 < data.len() {
        if data[i..i + 4] == START_MARKER {
            if (data[i + 4] & 0x1F) == 5 {
                return true;
            }
            i += 4;
        } else {
            i += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(width: u32, height: u32) -> VideoConfig {
        VideoConfig {
            width,
            height,
            fps: 25,
            bitrate: 1_500_000,
            gop: 25,
            b_frames: 0,
            codec: None,
        }
    }

    /// The engine chain depends on the local FFmpeg build; tests that need a
    /// real engine bail out quietly when none is available.
    fn open_or_skip(width: u32, height: u32) -> Option<VideoSession> {
        match VideoSession::open(&test_config(width, height)) {
            Ok(session) => Some(session),
            Err(e) => {
                eprintln!("skipping: no H.264 encoder available ({e})");
                None
            }
        }
    }

    fn gray_frame(width: u32, height: u32) -> MediaFrame {
        let size = (width * height * 3 / 2) as usize;
        MediaFrame::video(Bytes::from(vec![128u8; size]), width, height)
    }

    #[test]
    fn test_open_rejects_odd_dimensions() {
        assert!(VideoSession::open(&test_config(1281, 720)).is_err());
        assert!(VideoSession::open(&test_config(1280, 719)).is_err());
        assert!(VideoSession::open(&test_config(0, 720)).is_err());
        assert!(VideoSession::open(&test_config(1280, 0)).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let Some(mut session) = open_or_skip(320, 240) else {
            return;
        };
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Ended);
        assert!(matches!(session.encode(None, 0), Ok(EncodePoll::End)));
    }

    #[test]
    fn test_split_parameter_sets_roundtrip() {
        let a = [0x67, 0x42, 0xc0, 0x1f, 0xa6];
        let b = [0x68, 0xce, 0x3c, 0x80];
        let mut blob = Vec::new();
        blob.extend_from_slice(&START_MARKER);
        blob.extend_from_slice(&a);
        blob.extend_from_slice(&START_MARKER);
        blob.extend_from_slice(&b);

        let (sps, pps) = split_parameter_sets(&blob).unwrap();
        assert_eq!(&sps[..], &a);
        assert_eq!(&pps[..], &b);
    }

    #[test]
    fn test_split_parameter_sets_single_byte_records() {
        let blob = [0, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x68];
        let (sps, pps) = split_parameter_sets(&blob).unwrap();
        assert_eq!(&sps[..], &[0x67]);
        assert_eq!(&pps[..], &[0x68]);
    }

    #[test]
    fn test_split_parameter_sets_rejects_malformed_blobs() {
        assert!(split_parameter_sets(&[]).is_err());
        assert!(split_parameter_sets(&[0x67, 0x68]).is_err());
        // Single record only.
        assert!(split_parameter_sets(&[0, 0, 0, 1, 0x67, 0x42]).is_err());
        // Second record empty.
        assert!(split_parameter_sets(&[0, 0, 0, 1, 0x67, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_contains_idr() {
        assert!(contains_idr(&[0, 0, 0, 1, 0x65, 0x88]));
        assert!(!contains_idr(&[0, 0, 0, 1, 0x41, 0x9a]));
        assert!(!contains_idr(&[0x65, 0x88]));
    }

    #[test]
    fn test_buffer_mismatch_is_recoverable() {
        let Some(mut session) = open_or_skip(320, 240) else {
            return;
        };

        let short = MediaFrame::video(Bytes::from(vec![0u8; 100]), 320, 240);
        match session.encode(Some(&short), 0) {
            Err(EncodeError::BufferMismatch { expected, got }) => {
                assert_eq!(expected, 320 * 240 * 3 / 2);
                assert_eq!(got, 100);
            }
            other => panic!("expected buffer mismatch, got {:?}", other),
        }

        // The session stays usable afterwards.
        assert_eq!(session.state(), SessionState::Ready);
        let frame = gray_frame(320, 240);
        assert!(session.encode(Some(&frame), 0).is_ok());
    }

    #[test]
    fn test_scenario_25_frames_1280x720() {
        let Some(mut session) = open_or_skip(1280, 720) else {
            return;
        };

        let frame = gray_frame(1280, 720);
        let mut packets = 0usize;
        for n in 0..25i64 {
            match session.encode(Some(&frame), n * 40) {
                Ok(EncodePoll::Packet(pkt)) => {
                    packets += 1;
                    assert!(!pkt.data.is_empty());
                    assert_eq!(pkt.kind, MediaKind::Video);
                }
                Ok(EncodePoll::Retry { .. }) => {}
                Ok(EncodePoll::End) => panic!("unexpected end of stream"),
                Err(e) => panic!("unexpected encoder error: {e}"),
            }
        }
        assert!(packets >= 1, "the engine must not stall forever");
    }

    #[test]
    fn test_flush_yields_end_and_preserves_order() {
        let Some(mut session) = open_or_skip(320, 240) else {
            return;
        };

        let frame = gray_frame(320, 240);
        let mut pts_seen: Vec<i64> = Vec::new();
        for n in 0..10i64 {
            if let Ok(EncodePoll::Packet(pkt)) = session.encode(Some(&frame), n * 40) {
                pts_seen.push(pkt.pts);
            }
        }

        let mut ended = false;
        for _ in 0..128 {
            match session.encode(None, 400) {
                Ok(EncodePoll::Packet(pkt)) => pts_seen.push(pkt.pts),
                Ok(EncodePoll::Retry { .. }) => {}
                Ok(EncodePoll::End) => {
                    ended = true;
                    break;
                }
                Err(e) => panic!("unexpected encoder error during drain: {e}"),
            }
        }

        assert!(ended, "flush must terminate in End");
        assert!(!pts_seen.is_empty());
        assert!(pts_seen.windows(2).all(|w| w[0] <= w[1]), "order must hold");
        assert!(matches!(session.encode(None, 400), Ok(EncodePoll::End)));
    }
}
