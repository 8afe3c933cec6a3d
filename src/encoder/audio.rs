//! AAC audio encoder session

use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioEncoder, AudioFrameMut, ChannelLayout};
use ac_ffmpeg::codec::{CodecError, CodecParameters, Encoder};
use anyhow::anyhow;
use bytes::Bytes;
use std::time::Duration;

use crate::encoder::{EncodeError, EncodePoll, SessionState};
use crate::pipeline::types::{EncodedPacket, MediaFrame, MediaKind};

/// Immutable configuration of an audio session.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u64,
    /// Specific engine to use; defaults to the native AAC encoder.
    pub codec: Option<String>,
}

/// Wraps the AAC engine. Input frames carry interleaved s16le samples, the
/// engine consumes planar float; the conversion happens here so capturers
/// stay format-agnostic.
pub struct AudioSession {
    encoder: Option<AudioEncoder>,
    state: SessionState,
    sample_rate: u32,
    channels: usize,
    /// Samples per channel the engine consumes per frame
    frame_samples: usize,
    packet_duration: Duration,
    extradata: Bytes,
    codec_name: String,
}

impl AudioSession {
    /// Allocate and configure the engine. The engine dictates the frame
    /// size; callers read it back via [`frame_samples`](Self::frame_samples)
    /// and must deliver exactly that many samples per channel.
    pub fn open(config: &AudioConfig) -> anyhow::Result<Self> {
        if config.sample_rate == 0 {
            return Err(anyhow!("audio sample rate must be positive"));
        }
        if config.channels == 0 {
            return Err(anyhow!("audio channel count must be positive"));
        }

        let codec_name = config.codec.clone().unwrap_or_else(|| "aac".to_string());
        let channel_layout = ChannelLayout::from_channels(config.channels as u32)
            .ok_or_else(|| anyhow!("no channel layout for {} channels", config.channels))?;

        let encoder = AudioEncoder::builder(&codec_name)?
            .sample_rate(config.sample_rate)
            .channel_layout(channel_layout)
            .sample_format(get_sample_format("fltp"))
            .set_option("b", config.bitrate.to_string())
            .set_option("flags", "+global_header")
            .build()?;

        let frame_samples = encoder.samples_per_frame().unwrap_or(1024);
        let extradata = CodecParameters::from(encoder.codec_parameters())
            .extradata()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();

        let packet_duration = Duration::from_micros(
            frame_samples as u64 * 1_000_000 / config.sample_rate as u64,
        );

        log::info!(
            "audio session open: {} Hz, {} channels via {}, {} samples/frame",
            config.sample_rate,
            config.channels,
            codec_name,
            frame_samples
        );

        Ok(Self {
            encoder: Some(encoder),
            state: SessionState::Ready,
            sample_rate: config.sample_rate,
            channels: config.channels as usize,
            frame_samples,
            packet_duration,
            extradata,
            codec_name,
        })
    }

    /// Samples per channel expected in each input frame.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Expected input frame size in bytes (interleaved s16le).
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples * self.channels * 2
    }

    /// Nominal wall-clock duration of one encoded packet.
    pub fn packet_duration(&self) -> Duration {
        self.packet_duration
    }

    /// Out-of-band configuration bytes produced by the engine, if any.
    pub fn extradata(&self) -> Bytes {
        self.extradata.clone()
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Feed one interleaved s16le frame (or none, to begin a flush) and
    /// attempt to drain one compressed unit.
    pub fn encode(
        &mut self,
        frame: Option<&MediaFrame>,
        pts: i64,
    ) -> Result<EncodePoll, EncodeError> {
        match self.state {
            SessionState::Ended => return Ok(EncodePoll::End),
            SessionState::Faulted => {
                return Err(EncodeError::Fatal(anyhow!("audio session is faulted")));
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
                if raw.data.len() != self.frame_bytes() {
                    return Err(EncodeError::BufferMismatch {
                        expected: self.frame_bytes(),
                        got: raw.data.len(),
                    });
                }

                let engine_frame = self.fill_frame(&raw.data)?;
                let encoder = self.engine_mut()?;
                match encoder.try_push(engine_frame) {
                    Ok(()) => {}
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
                    Err(CodecError::Again(_)) => input_saturated = true,
                    Err(CodecError::Error(e)) => return Err(self.fault(e.into())),
                }
            }
            None => {}
        }

        let encoder = self.engine_mut()?;
        match encoder.take() {
            Ok(Some(packet)) => Ok(EncodePoll::Packet(EncodedPacket {
                kind: MediaKind::Audio,
                data: Bytes::copy_from_slice(packet.data()),
                pts,
                duration: self.packet_duration,
                keyframe: false,
            })),
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
            log::info!("audio session closed ({})", self.codec_name);
        }
        if !self.state.is_terminal() {
            self.state = SessionState::Ended;
        }
    }

    fn engine_mut(&mut self) -> Result<&mut AudioEncoder, EncodeError> {
        self.encoder
            .as_mut()
            .ok_or_else(|| EncodeError::Fatal(anyhow!("audio session is closed")))
    }

    fn fault(&mut self, e: anyhow::Error) -> EncodeError {
        self.state = SessionState::Faulted;
        EncodeError::Fatal(e)
    }

    /// Convert interleaved s16le samples into a planar float engine frame.
    fn fill_frame(
        &mut self,
        data: &[u8],
    ) -> Result<ac_ffmpeg::codec::audio::AudioFrame, EncodeError> {
        let frame_samples = self.frame_samples;
        let channels = self.channels;
        let encoder = self.engine_mut()?;

        let mut frame = AudioFrameMut::silence(
            encoder.codec_parameters().channel_layout(),
            encoder.codec_parameters().sample_format(),
            encoder.codec_parameters().sample_rate(),
            frame_samples,
        );

        let mut planes = frame.planes_mut();
        for ch in 0..channels {
            let plane = planes[ch].data_mut();
            let samples: &mut [f32] = unsafe {
                std::slice::from_raw_parts_mut(plane.as_mut_ptr() as *mut f32, frame_samples)
            };
            for (i, sample) in samples.iter_mut().enumerate() {
                let idx = (i * channels + ch) * 2;
                let s = i16::from_le_bytes([data[idx], data[idx + 1]]);
                *sample = s as f32 / 32768.0;
            }
        }
        drop(planes);

        Ok(frame.freeze())
    }
}

impl Drop for AudioSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AudioConfig {
        AudioConfig {
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128 * 1024,
            codec: None,
        }
    }

    fn open_or_skip() -> Option<AudioSession> {
        match AudioSession::open(&test_config()) {
            Ok(session) => Some(session),
            Err(e) => {
                eprintln!("skipping: no AAC encoder available ({e})");
                None
            }
        }
    }

    fn silence_frame(session: &AudioSession) -> MediaFrame {
        MediaFrame::audio(
            Bytes::from(vec![0u8; session.frame_bytes()]),
            48_000,
            2,
            session.frame_samples(),
        )
    }

    #[test]
    fn test_open_rejects_zero_parameters() {
        let mut config = test_config();
        config.sample_rate = 0;
        assert!(AudioSession::open(&config).is_err());

        let mut config = test_config();
        config.channels = 0;
        assert!(AudioSession::open(&config).is_err());
    }

    #[test]
    fn test_frame_geometry() {
        let Some(session) = open_or_skip() else {
            return;
        };
        assert!(session.frame_samples() > 0);
        assert_eq!(
            session.frame_bytes(),
            session.frame_samples() * 2 * 2,
            "2 channels, 2 bytes per sample"
        );
        let expected =
            Duration::from_micros(session.frame_samples() as u64 * 1_000_000 / 48_000);
        assert_eq!(session.packet_duration(), expected);
    }

    #[test]
    fn test_encode_silence_until_packet() {
        let Some(mut session) = open_or_skip() else {
            return;
        };

        let frame = silence_frame(&session);
        let samples_per_frame = session.frame_samples() as i64;
        let mut packets = 0usize;
        for n in 0..20 {
            match session.encode(Some(&frame), n * samples_per_frame) {
                Ok(EncodePoll::Packet(pkt)) => {
                    packets += 1;
                    assert_eq!(pkt.kind, MediaKind::Audio);
                    assert!(!pkt.keyframe);
                }
                Ok(EncodePoll::Retry { .. }) => {}
                Ok(EncodePoll::End) => panic!("unexpected end of stream"),
                Err(e) => panic!("unexpected encoder error: {e}"),
            }
        }
        assert!(packets >= 1, "the engine must not stall forever");
    }

    #[test]
    fn test_mismatched_frame_is_skipped_not_fatal() {
        let Some(mut session) = open_or_skip() else {
            return;
        };

        let short = MediaFrame::audio(Bytes::from(vec![0u8; 10]), 48_000, 2, 5);
        assert!(matches!(
            session.encode(Some(&short), 0),
            Err(EncodeError::BufferMismatch { .. })
        ));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_flush_terminates() {
        let Some(mut session) = open_or_skip() else {
            return;
        };

        let frame = silence_frame(&session);
        for n in 0..4 {
            let _ = session
                .encode(Some(&frame), n * session.frame_samples() as i64)
                .expect("steady-state encode");
        }

        let mut ended = false;
        for _ in 0..128 {
            match session.encode(None, 0) {
                Ok(EncodePoll::End) => {
                    ended = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => panic!("unexpected encoder error during drain: {e}"),
            }
        }
        assert!(ended);
        assert_eq!(session.state(), SessionState::Ended);

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Ended);
    }
}
