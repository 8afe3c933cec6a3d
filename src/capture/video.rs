//! Video frame capture
//!
//! Produces raw YUV420p frames at a fixed rate, either from a raw video
//! file (rewinding at end of file) or from a synthetic moving test pattern
//! that needs no input assets.

use anyhow::{Context, anyhow};
use bytes::Bytes;
use log::{info, warn};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::capture::FrameSink;
use crate::pipeline::types::MediaFrame;

/// Where video frames come from.
#[derive(Debug, Clone)]
pub enum VideoSource {
    /// Synthetic moving test pattern
    Pattern,
    /// Raw YUV420p file, read frame by frame and rewound at EOF
    File(PathBuf),
}

pub struct VideoCapturer {
    source: VideoSource,
    width: u32,
    height: u32,
    fps: u32,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl VideoCapturer {
    /// Validate the source, probing any input file. Fails fast so
    /// configuration problems abort pipeline startup instead of surfacing
    /// mid-stream.
    pub fn new(source: &VideoSource, width: u32, height: u32, fps: u32) -> anyhow::Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("capture dimensions must be positive"));
        }
        if fps == 0 {
            return Err(anyhow!("capture fps must be positive"));
        }

        if let VideoSource::File(path) = source {
            File::open(path).with_context(|| format!("open video input {}", path.display()))?;
        }

        Ok(Self {
            source: source.clone(),
            width,
            height,
            fps,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    /// Start the capture thread, delivering frames to `sink` until stopped.
    pub fn start(&mut self, mut sink: Box<dyn FrameSink>) -> anyhow::Result<()> {
        if self.handle.is_some() {
            return Err(anyhow!("video capturer already running"));
        }

        let stop = Arc::clone(&self.stop);
        stop.store(false, Ordering::Release);

        let (width, height, fps) = (self.width, self.height, self.fps);
        let mut input = match &self.source {
            VideoSource::Pattern => None,
            VideoSource::File(path) => Some(
                File::open(path)
                    .with_context(|| format!("open video input {}", path.display()))?,
            ),
        };
        let interval = Duration::from_secs_f64(1.0 / fps as f64);
        let frame_size = (width * height * 3 / 2) as usize;

        let handle = thread::Builder::new()
            .name("video-capture".into())
            .spawn(move || {
                info!("video capture started ({}x{}@{})", width, height, fps);
                let mut buffer = vec![0u8; frame_size];
                let mut tick = 0u64;
                let mut next = Instant::now();

                while !stop.load(Ordering::Acquire) {
                    match &mut input {
                        Some(file) => {
                            if let Err(e) = read_frame(file, &mut buffer) {
                                warn!("video input read failed: {}", e);
                                break;
                            }
                        }
                        None => fill_pattern(&mut buffer, width, height, tick),
                    }
                    tick += 1;

                    sink.on_frame(MediaFrame::video(
                        Bytes::copy_from_slice(&buffer),
                        width,
                        height,
                    ));

                    next += interval;
                    let pause = next.saturating_duration_since(Instant::now());
                    if !pause.is_zero() {
                        thread::sleep(pause);
                    }
                }
                info!("video capture stopped after {} frames", tick);
            })
            .context("spawn video capture thread")?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the capture thread and wait for it to exit. After this returns,
    /// no further callback fires.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for VideoCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Read one frame worth of bytes, rewinding at EOF so file sources loop.
fn read_frame(file: &mut File, buffer: &mut [u8]) -> std::io::Result<()> {
    match file.read_exact(buffer) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(buffer)
        }
        Err(e) => Err(e),
    }
}

/// Paint a moving luma gradient over flat chroma. Cheap, deterministic and
/// visually obvious when the stream reaches a player.
fn fill_pattern(buffer: &mut [u8], width: u32, height: u32, tick: u64) {
    let (w, h) = (width as usize, height as usize);
    let shift = (tick * 4) as usize;

    let (luma, chroma) = buffer.split_at_mut(w * h);
    for (y, row) in luma.chunks_exact_mut(w).enumerate() {
        for (x, px) in row.iter_mut().enumerate() {
            *px = ((x + y + shift) & 0xFF) as u8;
        }
    }

    let quarter = w / 2 * (h / 2);
    let (u, v) = chroma.split_at_mut(quarter);
    u.fill(((shift / 2) & 0x7F) as u8 + 64);
    v.fill(128);
}
