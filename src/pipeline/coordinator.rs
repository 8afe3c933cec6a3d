//! Pipeline coordinator
//!
//! Owns the capturers, encoder sessions and push sink, and enforces the
//! init/teardown ordering: sessions open first (the sink needs their
//! finalized codec parameters, including the extracted header bytes, before
//! it can establish the outbound session), then the transport connects, and
//! only then do the capturers start. Teardown is the strict reverse.

use anyhow::Context;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::capture::{AudioCapturer, FrameSink, VideoCapturer};
use crate::config::PushConfig;
use crate::encoder::{AudioSession, EncodeError, EncodePoll, VideoSession};
use crate::pipeline::clock::{MediaClock, VIDEO_TICK_HZ};
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::status::{
    ERR_AUDIO_ENCODE, ERR_VIDEO_ENCODE, StatusChannel, StatusMessage,
};
use crate::pipeline::types::MediaFrame;
use crate::sink::transport::{AudioStreamParams, TcpPushSession, VideoStreamParams};
use crate::sink::{PushSink, TransportSession};

/// How often the running pipeline logs a health summary.
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on drain iterations when a frame handler flushes its
/// session at teardown.
const DRAIN_LIMIT: usize = 128;

pub struct PushCoordinator {
    sink: PushSink,
    health: Arc<PipelineHealth>,
    audio_capture: Option<AudioCapturer>,
    video_capture: Option<VideoCapturer>,
    log_cancel: CancellationToken,
    running: bool,
}

impl PushCoordinator {
    /// Initialize the full pipeline against the crate's TCP push transport.
    pub fn init(
        config: &PushConfig,
        status: StatusChannel,
        handle: Handle,
    ) -> anyhow::Result<Self> {
        let transport = Box::new(TcpPushSession::new(
            &config.url,
            &config.transport,
            config.timeout,
        ));
        Self::init_with_transport(config, status, handle, transport)
    }

    /// Initialize against a caller-supplied transport session.
    pub fn init_with_transport(
        config: &PushConfig,
        status: StatusChannel,
        handle: Handle,
        mut transport: Box<dyn TransportSession>,
    ) -> anyhow::Result<Self> {
        // The shared baseline is established here, before any capture
        // thread exists, so timestamp reads never race the reset.
        let clock = Arc::new(MediaClock::start(config.sample_rate, VIDEO_TICK_HZ));
        let health = Arc::new(PipelineHealth::new());

        // Sessions open before the sink sees any stream configuration.
        let audio_session =
            AudioSession::open(&config.audio_config()).context("open audio session")?;
        let video_session =
            VideoSession::open(&config.video_config()).context("open video session")?;

        let (sps, pps) = video_session.parameter_sets();
        transport.configure_video(VideoStreamParams {
            width: config.width,
            height: config.height,
            fps: config.fps,
            bitrate: config.video_bitrate,
            codec: video_session.codec_name().to_string(),
            sps,
            pps,
            frame_duration: video_session.packet_duration(),
        });
        transport.configure_audio(AudioStreamParams {
            sample_rate: config.sample_rate,
            channels: config.channels,
            bitrate: config.audio_bitrate,
            codec: audio_session.codec_name().to_string(),
            extradata: audio_session.extradata(),
            frame_duration: audio_session.packet_duration(),
        });

        let sink = PushSink::new(
            config.max_queue_duration,
            status.clone(),
            Arc::clone(&health),
            handle.clone(),
        );
        sink.connect(transport).context("connect push session")?;

        // The audio capturer chunks samples to the engine's frame size.
        let mut audio_capture = AudioCapturer::new(
            &config.audio_source,
            config.sample_rate,
            config.channels,
            audio_session.frame_samples(),
        )
        .context("init audio capture")?;
        let mut video_capture = VideoCapturer::new(
            &config.video_source,
            config.width,
            config.height,
            config.fps,
        )
        .context("init video capture")?;

        audio_capture
            .start(Box::new(AudioFrameHandler {
                session: audio_session,
                clock: Arc::clone(&clock),
                sink: sink.clone(),
                status: status.clone(),
                health: Arc::clone(&health),
                degraded: false,
                last_pts: 0,
            }))
            .context("start audio capture")?;
        video_capture
            .start(Box::new(VideoFrameHandler {
                session: video_session,
                clock: Arc::clone(&clock),
                sink: sink.clone(),
                status,
                health: Arc::clone(&health),
                degraded: false,
                last_pts: 0,
            }))
            .context("start video capture")?;

        let log_cancel = CancellationToken::new();
        spawn_health_log(&handle, Arc::clone(&health), log_cancel.clone());

        info!("pipeline initialized");
        Ok(Self {
            sink,
            health,
            audio_capture: Some(audio_capture),
            video_capture: Some(video_capture),
            log_cancel,
            running: true,
        })
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        Arc::clone(&self.health)
    }

    /// Tear the pipeline down in strict reverse init order: capturers stop
    /// first (joining their threads; the frame handlers flush and close the
    /// encoder sessions as they drop), then the sink drains and closes.
    pub fn shutdown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        if let Some(mut capture) = self.video_capture.take() {
            capture.stop();
        }
        if let Some(mut capture) = self.audio_capture.take() {
            capture.stop();
        }

        self.log_cancel.cancel();
        self.sink.close();
        info!("pipeline shut down: {}", self.health.summary());
    }
}

impl Drop for PushCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_health_log(handle: &Handle, health: Arc<PipelineHealth>, cancel: CancellationToken) {
    handle.spawn(async move {
        let mut interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => info!("push pipeline: {}", health.summary()),
            }
        }
    });
}

/// Per-modality bridge from capture callbacks into the encoder session and
/// the push sink. Runs entirely on the capture thread; a fatal session
/// error degrades only this modality (fail closed: frames are dropped and
/// counted) while the other keeps publishing.
struct VideoFrameHandler {
    session: VideoSession,
    clock: Arc<MediaClock>,
    sink: PushSink,
    status: StatusChannel,
    health: Arc<PipelineHealth>,
    degraded: bool,
    last_pts: i64,
}

impl FrameSink for VideoFrameHandler {
    fn on_frame(&mut self, mut frame: MediaFrame) {
        if self.degraded {
            self.health.record_drop();
            return;
        }

        let pts = self.clock.video_pts();
        self.last_pts = pts;
        frame.pts = pts;

        match self.session.encode(Some(&frame), pts) {
            Ok(EncodePoll::Packet(packet)) => self.sink.push(packet),
            // The engine wants more input before emitting output; nothing is
            // lost, the next callback brings the next frame.
            Ok(EncodePoll::Retry { .. }) => {}
            Ok(EncodePoll::End) => {}
            Err(EncodeError::BufferMismatch { expected, got }) => {
                warn!("video frame skipped: expected {} bytes, got {}", expected, got);
                self.health.record_encode_failure();
            }
            Err(EncodeError::Fatal(e)) => {
                error!("video session failed: {e:#}");
                self.health.record_encode_failure();
                self.status.post(StatusMessage::FatalError {
                    code: ERR_VIDEO_ENCODE,
                    detail: format!("{e:#}"),
                });
                self.degraded = true;
            }
        }
    }
}

impl Drop for VideoFrameHandler {
    fn drop(&mut self) {
        if !self.degraded {
            drain_video(&mut self.session, &self.sink, self.last_pts);
        }
        self.session.close();
    }
}

struct AudioFrameHandler {
    session: AudioSession,
    clock: Arc<MediaClock>,
    sink: PushSink,
    status: StatusChannel,
    health: Arc<PipelineHealth>,
    degraded: bool,
    last_pts: i64,
}

impl FrameSink for AudioFrameHandler {
    fn on_frame(&mut self, mut frame: MediaFrame) {
        if self.degraded {
            self.health.record_drop();
            return;
        }

        let pts = self.clock.audio_pts();
        self.last_pts = pts;
        frame.pts = pts;

        match self.session.encode(Some(&frame), pts) {
            Ok(EncodePoll::Packet(packet)) => self.sink.push(packet),
            Ok(EncodePoll::Retry { .. }) => {}
            Ok(EncodePoll::End) => {}
            Err(EncodeError::BufferMismatch { expected, got }) => {
                warn!("audio frame skipped: expected {} bytes, got {}", expected, got);
                self.health.record_encode_failure();
            }
            Err(EncodeError::Fatal(e)) => {
                error!("audio session failed: {e:#}");
                self.health.record_encode_failure();
                self.status.post(StatusMessage::FatalError {
                    code: ERR_AUDIO_ENCODE,
                    detail: format!("{e:#}"),
                });
                self.degraded = true;
            }
        }
    }
}

impl Drop for AudioFrameHandler {
    fn drop(&mut self) {
        if !self.degraded {
            drain_audio(&mut self.session, &self.sink, self.last_pts);
        }
        self.session.close();
    }
}

fn drain_video(session: &mut VideoSession, sink: &PushSink, pts: i64) {
    for _ in 0..DRAIN_LIMIT {
        match session.encode(None, pts) {
            Ok(EncodePoll::Packet(packet)) => sink.push(packet),
            Ok(EncodePoll::Retry { .. }) => {}
            _ => break,
        }
    }
}

fn drain_audio(session: &mut AudioSession, sink: &PushSink, pts: i64) {
    for _ in 0..DRAIN_LIMIT {
        match session.encode(None, pts) {
            Ok(EncodePoll::Packet(packet)) => sink.push(packet),
            Ok(EncodePoll::Retry { .. }) => {}
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Properties;
    use crate::pipeline::types::{EncodedPacket, MediaKind};
    use async_trait::async_trait;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::runtime::Runtime;

    struct RecordingTransport {
        sent: Arc<Mutex<Vec<EncodedPacket>>>,
        video_params: Arc<Mutex<Option<VideoStreamParams>>>,
        connected_after_config: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl TransportSession for RecordingTransport {
        fn configure_video(&mut self, params: VideoStreamParams) {
            *self.video_params.lock().unwrap() = Some(params);
        }

        fn configure_audio(&mut self, _params: AudioStreamParams) {}

        async fn connect(&mut self) -> anyhow::Result<()> {
            // Records whether the init ordering held: streams first.
            *self.connected_after_config.lock().unwrap() =
                self.video_params.lock().unwrap().is_some();
            Ok(())
        }

        async fn send(&mut self, packet: &EncodedPacket) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(packet.clone());
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn temp_pcm(bytes: usize) -> PathBuf {
        let path = std::env::temp_dir().join(format!("pushcast-coordinator-{}.pcm", bytes));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0u8; bytes]).unwrap();
        path
    }

    #[test]
    fn test_pipeline_end_to_end_with_test_sources() {
        let runtime = Runtime::new().unwrap();
        let pcm = temp_pcm(64 * 1024);

        let mut properties = Properties::new();
        properties.set("width", "320");
        properties.set("height", "240");
        properties.set("fps", "50");
        properties.set("audio_source", "file");
        properties.set("audio_file", pcm.to_str().unwrap());
        let config = PushConfig::from_properties(&properties).unwrap();

        let sent = Arc::new(Mutex::new(Vec::new()));
        let video_params = Arc::new(Mutex::new(None));
        let ordered = Arc::new(Mutex::new(false));
        let transport = Box::new(RecordingTransport {
            sent: Arc::clone(&sent),
            video_params: Arc::clone(&video_params),
            connected_after_config: Arc::clone(&ordered),
        });

        let status = StatusChannel::new(16);
        let coordinator = PushCoordinator::init_with_transport(
            &config,
            status.clone(),
            runtime.handle().clone(),
            transport,
        );
        let mut coordinator = match coordinator {
            Ok(coordinator) => coordinator,
            Err(e) => {
                // Encoder availability depends on the local FFmpeg build.
                eprintln!("skipping: pipeline init failed ({e:#})");
                let _ = std::fs::remove_file(&pcm);
                return;
            }
        };

        std::thread::sleep(Duration::from_millis(400));
        coordinator.shutdown();
        let _ = std::fs::remove_file(&pcm);

        assert!(
            *ordered.lock().unwrap(),
            "streams must be configured before connect"
        );
        let params = video_params.lock().unwrap();
        let params = params.as_ref().expect("video stream configured");
        assert!(!params.sps.is_empty());
        assert!(!params.pps.is_empty());

        let sent = sent.lock().unwrap();
        assert!(
            sent.iter().any(|p| p.kind == MediaKind::Video),
            "video packets must reach the transport"
        );
        assert!(
            sent.iter().any(|p| p.kind == MediaKind::Audio),
            "audio packets must reach the transport"
        );

        // Within one modality, packets keep their encode order.
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let pts: Vec<i64> = sent
                .iter()
                .filter(|p| p.kind == kind)
                .map(|p| p.pts)
                .collect();
            assert!(pts.windows(2).all(|w| w[0] <= w[1]), "{kind} out of order");
        }
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let runtime = Runtime::new().unwrap();
        let pcm = temp_pcm(16 * 1024);

        let mut properties = Properties::new();
        properties.set("width", "64");
        properties.set("height", "64");
        properties.set("audio_source", "file");
        properties.set("audio_file", pcm.to_str().unwrap());
        let config = PushConfig::from_properties(&properties).unwrap();

        let transport = Box::new(RecordingTransport {
            sent: Arc::new(Mutex::new(Vec::new())),
            video_params: Arc::new(Mutex::new(None)),
            connected_after_config: Arc::new(Mutex::new(false)),
        });

        let status = StatusChannel::new(16);
        let Ok(mut coordinator) = PushCoordinator::init_with_transport(
            &config,
            status,
            runtime.handle().clone(),
            transport,
        ) else {
            eprintln!("skipping: pipeline init failed");
            let _ = std::fs::remove_file(&pcm);
            return;
        };

        coordinator.shutdown();
        coordinator.shutdown();
        let _ = std::fs::remove_file(&pcm);
    }
}
