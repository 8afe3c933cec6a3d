//! Audio sample capture
//!
//! Produces interleaved s16le frames of exactly the encoder's frame size,
//! either from the default input device (via cpal) or from a raw PCM file
//! paced at the configured sample rate.

use anyhow::{Context, anyhow};
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use log::{error, info, warn};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::capture::FrameSink;
use crate::pipeline::types::MediaFrame;

/// Where audio samples come from.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Default input device
    Device,
    /// Raw s16le PCM file, read chunk by chunk and rewound at EOF
    File(PathBuf),
}

pub struct AudioCapturer {
    source: AudioSource,
    sample_rate: u32,
    channels: u16,
    /// Samples per channel per delivered frame, dictated by the encoder
    frame_samples: usize,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AudioCapturer {
    pub fn new(
        source: &AudioSource,
        sample_rate: u32,
        channels: u16,
        frame_samples: usize,
    ) -> anyhow::Result<Self> {
        if sample_rate == 0 || channels == 0 || frame_samples == 0 {
            return Err(anyhow!("audio capture parameters must be positive"));
        }

        if let AudioSource::File(path) = source {
            File::open(path).with_context(|| format!("open audio input {}", path.display()))?;
        }

        Ok(Self {
            source: source.clone(),
            sample_rate,
            channels,
            frame_samples,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    /// Start the capture thread, delivering frames to `sink` until stopped.
    pub fn start(&mut self, sink: Box<dyn FrameSink>) -> anyhow::Result<()> {
        if self.handle.is_some() {
            return Err(anyhow!("audio capturer already running"));
        }

        let stop = Arc::clone(&self.stop);
        stop.store(false, Ordering::Release);

        let handle = match &self.source {
            AudioSource::File(path) => {
                let file = File::open(path)
                    .with_context(|| format!("open audio input {}", path.display()))?;
                self.spawn_file_thread(file, sink, stop)?
            }
            AudioSource::Device => self.spawn_device_thread(sink, stop)?,
        };

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

    fn spawn_file_thread(
        &self,
        mut file: File,
        mut sink: Box<dyn FrameSink>,
        stop: Arc<AtomicBool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let (sample_rate, channels, frame_samples) =
            (self.sample_rate, self.channels, self.frame_samples);
        let chunk_bytes = frame_samples * channels as usize * 2;
        let interval =
            Duration::from_micros(frame_samples as u64 * 1_000_000 / sample_rate as u64);

        thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                info!(
                    "audio capture started (file, {} Hz, {} channels)",
                    sample_rate, channels
                );
                let mut buffer = vec![0u8; chunk_bytes];
                let mut next = Instant::now();

                while !stop.load(Ordering::Acquire) {
                    if let Err(e) = read_looped(&mut file, &mut buffer) {
                        warn!("audio input read failed: {}", e);
                        break;
                    }

                    sink.on_frame(MediaFrame::audio(
                        Bytes::copy_from_slice(&buffer),
                        sample_rate,
                        channels,
                        frame_samples,
                    ));

                    next += interval;
                    let pause = next.saturating_duration_since(Instant::now());
                    if !pause.is_zero() {
                        thread::sleep(pause);
                    }
                }
                info!("audio capture stopped");
            })
            .context("spawn audio capture thread")
    }

    fn spawn_device_thread(
        &self,
        sink: Box<dyn FrameSink>,
        stop: Arc<AtomicBool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let (sample_rate, channels, frame_samples) =
            (self.sample_rate, self.channels, self.frame_samples);

        // The stream itself is built inside the thread (cpal streams are
        // not Send); build failures are logged, not propagated.
        thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let assembler = Arc::new(Mutex::new(ChunkAssembler {
                    sink,
                    buffer: Vec::new(),
                    sample_rate,
                    channels,
                    frame_samples,
                }));

                let host = cpal::default_host();
                let Some(device) = host.default_input_device() else {
                    error!("no default audio input device found");
                    return;
                };

                let config = StreamConfig {
                    channels,
                    sample_rate: SampleRate(sample_rate),
                    buffer_size: BufferSize::Default,
                };
                let err_fn = |err| error!("audio stream error: {}", err);

                // Prefer the native s16 path, fall back to f32 conversion.
                let i16_assembler = Arc::clone(&assembler);
                let stream = device
                    .build_input_stream(
                        &config,
                        move |data: &[i16], _: &_| {
                            i16_assembler.lock().unwrap().push_i16(data)
                        },
                        err_fn,
                        None,
                    )
                    .or_else(|e| {
                        warn!("s16 input stream unavailable ({}), trying f32", e);
                        let f32_assembler = Arc::clone(&assembler);
                        device.build_input_stream(
                            &config,
                            move |data: &[f32], _: &_| {
                                f32_assembler.lock().unwrap().push_f32(data)
                            },
                            err_fn,
                            None,
                        )
                    });

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("failed to open audio input stream: {}", e);
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    error!("failed to start audio input stream: {}", e);
                    return;
                }
                info!(
                    "audio capture started (device, {} Hz, {} channels)",
                    sample_rate, channels
                );

                while !stop.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(10));
                }

                let _ = stream.pause();
                drop(stream);
                info!("audio capture stopped");
            })
            .context("spawn audio capture thread")
    }
}

impl Drop for AudioCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accumulates device samples and emits frames of exactly the encoder's
/// frame size.
struct ChunkAssembler {
    sink: Box<dyn FrameSink>,
    buffer: Vec<i16>,
    sample_rate: u32,
    channels: u16,
    frame_samples: usize,
}

impl ChunkAssembler {
    fn push_i16(&mut self, data: &[i16]) {
        self.buffer.extend_from_slice(data);
        self.emit();
    }

    fn push_f32(&mut self, data: &[f32]) {
        self.buffer
            .extend(data.iter().map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16));
        self.emit();
    }

    fn emit(&mut self) {
        let chunk = self.frame_samples * self.channels as usize;
        while self.buffer.len() >= chunk {
            let mut bytes = Vec::with_capacity(chunk * 2);
            for sample in self.buffer.drain(..chunk) {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            self.sink.on_frame(MediaFrame::audio(
                Bytes::from(bytes),
                self.sample_rate,
                self.channels,
                self.frame_samples,
            ));
        }
    }
}

/// Read one chunk worth of bytes, rewinding at EOF so file sources loop.
fn read_looped(file: &mut File, buffer: &mut [u8]) -> std::io::Result<()> {
    match file.read_exact(buffer) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(buffer)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_pcm(name: &str, bytes: usize) -> PathBuf {
        let path = std::env::temp_dir().join(format!("pushcast-test-{}-{}.pcm", name, bytes));
        let mut file = File::create(&path).unwrap();
        let data: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        path
    }

    #[test]
    fn test_file_capture_delivers_exact_chunks() {
        let path = temp_pcm("chunks", 4096);
        let mut capturer =
            AudioCapturer::new(&AudioSource::File(path.clone()), 48_000, 2, 256).unwrap();

        let frames = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&frames);
        capturer
            .start(Box::new(move |frame: MediaFrame| {
                recorder.lock().unwrap().push(frame);
            }))
            .expect("start");

        thread::sleep(Duration::from_millis(60));
        capturer.stop();
        let _ = std::fs::remove_file(&path);

        let frames = frames.lock().unwrap();
        assert!(!frames.is_empty());
        for frame in frames.iter() {
            // 256 samples * 2 channels * 2 bytes
            assert_eq!(frame.size(), 1024);
            assert_eq!(frame.samples, Some(256));
        }
    }

    #[test]
    fn test_file_capture_loops_past_eof() {
        // File holds less than two chunks; looping is required to keep going.
        let path = temp_pcm("loop", 1500);
        let mut capturer =
            AudioCapturer::new(&AudioSource::File(path.clone()), 48_000, 2, 256).unwrap();

        let count = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&count);
        capturer
            .start(Box::new(move |_frame: MediaFrame| {
                *counter.lock().unwrap() += 1;
            }))
            .expect("start");

        thread::sleep(Duration::from_millis(60));
        capturer.stop();
        let _ = std::fs::remove_file(&path);

        assert!(*count.lock().unwrap() >= 3);
    }

    #[test]
    fn test_missing_file_fails_at_init() {
        let source = AudioSource::File(PathBuf::from("/nonexistent/input.pcm"));
        assert!(AudioCapturer::new(&source, 48_000, 2, 1024).is_err());
    }

    #[test]
    fn test_chunk_assembler_f32_conversion() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&frames);
        let mut assembler = ChunkAssembler {
            sink: Box::new(move |frame: MediaFrame| {
                recorder.lock().unwrap().push(frame);
            }),
            buffer: Vec::new(),
            sample_rate: 48_000,
            channels: 1,
            frame_samples: 4,
        };

        assembler.push_f32(&[0.0, 1.0, -1.0, 0.5, 0.25]);
        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);

        let data = &frames[0].data;
        let sample =
            |i: usize| i16::from_le_bytes([data[i * 2], data[i * 2 + 1]]);
        assert_eq!(sample(0), 0);
        assert_eq!(sample(1), 32767);
        assert_eq!(sample(2), -32767);
        assert_eq!(sample(3), 16383);
        // The fifth sample stays buffered for the next chunk.
        assert_eq!(assembler.buffer.len(), 1);
    }
}
