//! Transport session boundary
//!
//! The pipeline only ever sees this trait: stream parameters are fixed per
//! modality before `connect()`, packets flow through `send()`, and failures
//! come back as plain errors for the transmit task to convert into status
//! messages. The TCP implementation below frames packets with a small binary
//! header after a JSON stream announcement; the wire format carries the
//! timing contract (pts + per-packet duration) and nothing else is promised.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::pipeline::types::{EncodedPacket, MediaKind};

/// Finalized video stream parameters, including the out-of-band parameter
/// records extracted by the encoder session.
#[derive(Debug, Clone)]
pub struct VideoStreamParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u64,
    pub codec: String,
    pub sps: Bytes,
    pub pps: Bytes,
    /// Nominal duration of one video packet
    pub frame_duration: Duration,
}

/// Finalized audio stream parameters.
#[derive(Debug, Clone)]
pub struct AudioStreamParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u64,
    pub codec: String,
    /// Out-of-band configuration bytes from the engine, if any
    pub extradata: Bytes,
    /// Nominal duration of one audio packet
    pub frame_duration: Duration,
}

/// Outbound streaming session.
#[async_trait]
pub trait TransportSession: Send {
    /// Fix the video stream parameters. Must precede `connect`.
    fn configure_video(&mut self, params: VideoStreamParams);

    /// Fix the audio stream parameters. Must precede `connect`.
    fn configure_audio(&mut self, params: AudioStreamParams);

    /// Establish the session with the remote server.
    async fn connect(&mut self) -> anyhow::Result<()>;

    /// Transmit one packet. An error here is a session failure.
    async fn send(&mut self, packet: &EncodedPacket) -> anyhow::Result<()>;

    /// Tear the session down.
    async fn close(&mut self);
}

#[derive(Serialize)]
struct StreamAnnounce<'a> {
    transport: &'a str,
    video: Option<VideoAnnounce>,
    audio: Option<AudioAnnounce>,
}

#[derive(Serialize)]
struct VideoAnnounce {
    codec: String,
    width: u32,
    height: u32,
    fps: u32,
    bitrate: u64,
    sps: Vec<u8>,
    pps: Vec<u8>,
    frame_duration_ms: u64,
}

#[derive(Serialize)]
struct AudioAnnounce {
    codec: String,
    sample_rate: u32,
    channels: u16,
    bitrate: u64,
    extradata: Vec<u8>,
    frame_duration_ms: u64,
}

const FRAME_ANNOUNCE: u8 = 0;
const FRAME_AUDIO: u8 = 1;
const FRAME_VIDEO: u8 = 2;
const FLAG_KEYFRAME: u8 = 0x01;

/// TCP push session: JSON announcement, then length-prefixed packets.
pub struct TcpPushSession {
    address: String,
    mode: String,
    io_timeout: Duration,
    video: Option<VideoStreamParams>,
    audio: Option<AudioStreamParams>,
    stream: Option<TcpStream>,
}

impl TcpPushSession {
    /// `url` accepts `push://host:port`, `tcp://host:port` or a bare
    /// `host:port`, with an optional path suffix that is ignored.
    pub fn new(url: &str, mode: &str, io_timeout: Duration) -> Self {
        Self {
            address: parse_address(url),
            mode: mode.to_string(),
            io_timeout,
            video: None,
            audio: None,
            stream: None,
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("push session is not connected"))?;
        timeout(self.io_timeout, stream.write_all(frame))
            .await
            .map_err(|_| anyhow!("push write timed out after {:?}", self.io_timeout))?
            .context("push write failed")?;
        Ok(())
    }
}

#[async_trait]
impl TransportSession for TcpPushSession {
    fn configure_video(&mut self, params: VideoStreamParams) {
        self.video = Some(params);
    }

    fn configure_audio(&mut self, params: AudioStreamParams) {
        self.audio = Some(params);
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        if self.video.is_none() && self.audio.is_none() {
            return Err(anyhow!("no streams configured before connect"));
        }
        if self.address.is_empty() {
            return Err(anyhow!("push url is not set"));
        }

        let stream = timeout(self.io_timeout, TcpStream::connect(self.address.as_str()))
            .await
            .map_err(|_| anyhow!("connect to {} timed out", self.address))?
            .with_context(|| format!("connect to {}", self.address))?;
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);

        let payload = {
            let announce = StreamAnnounce {
                transport: self.mode.as_str(),
                video: self.video.as_ref().map(|v| VideoAnnounce {
                    codec: v.codec.clone(),
                    width: v.width,
                    height: v.height,
                    fps: v.fps,
                    bitrate: v.bitrate,
                    sps: v.sps.to_vec(),
                    pps: v.pps.to_vec(),
                    frame_duration_ms: v.frame_duration.as_millis() as u64,
                }),
                audio: self.audio.as_ref().map(|a| AudioAnnounce {
                    codec: a.codec.clone(),
                    sample_rate: a.sample_rate,
                    channels: a.channels,
                    bitrate: a.bitrate,
                    extradata: a.extradata.to_vec(),
                    frame_duration_ms: a.frame_duration.as_millis() as u64,
                }),
            };
            serde_json::to_vec(&announce).context("serialize stream announcement")?
        };
        let frame = build_frame(FRAME_ANNOUNCE, 0, 0, 0, &payload);

        self.write_frame(&frame).await?;
        log::info!("push session connected to {}", self.address);
        Ok(())
    }

    async fn send(&mut self, packet: &EncodedPacket) -> anyhow::Result<()> {
        let kind = match packet.kind {
            MediaKind::Audio => FRAME_AUDIO,
            MediaKind::Video => FRAME_VIDEO,
        };
        let flags = if packet.keyframe { FLAG_KEYFRAME } else { 0 };
        let frame = build_frame(
            kind,
            flags,
            packet.pts,
            packet.duration.as_millis() as u32,
            &packet.data,
        );
        self.write_frame(&frame).await
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            log::info!("push session closed");
        }
    }
}

/// Frame layout: kind u8, flags u8, duration_ms u32, pts i64, len u32,
/// payload. All integers big-endian.
fn build_frame(kind: u8, flags: u8, pts: i64, duration_ms: u32, payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(18 + payload.len());
    frame.put_u8(kind);
    frame.put_u8(flags);
    frame.put_u32(duration_ms);
    frame.put_i64(pts);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame
}

fn parse_address(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let authority = without_scheme
        .split_once('/')
        .map(|(authority, _)| authority)
        .unwrap_or(without_scheme);
    authority.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_variants() {
        assert_eq!(parse_address("push://10.0.0.8:9000/live/stream"), "10.0.0.8:9000");
        assert_eq!(parse_address("tcp://host:1234"), "host:1234");
        assert_eq!(parse_address("host:1234"), "host:1234");
        assert_eq!(parse_address("host:1234/name"), "host:1234");
    }

    #[test]
    fn test_frame_layout() {
        let frame = build_frame(FRAME_VIDEO, FLAG_KEYFRAME, 1000, 40, &[0xAA, 0xBB]);
        assert_eq!(frame[0], FRAME_VIDEO);
        assert_eq!(frame[1], FLAG_KEYFRAME);
        assert_eq!(&frame[2..6], &40u32.to_be_bytes());
        assert_eq!(&frame[6..14], &1000i64.to_be_bytes());
        assert_eq!(&frame[14..18], &2u32.to_be_bytes());
        assert_eq!(&frame[18..], &[0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn test_connect_requires_configured_streams() {
        let mut session = TcpPushSession::new("127.0.0.1:1", "tcp", Duration::from_millis(100));
        assert!(session.connect().await.is_err());
    }
}
