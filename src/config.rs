//! Flat key/value configuration consumed at init time by every component

use anyhow::{Context, anyhow};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::capture::{AudioSource, VideoSource};
use crate::encoder::audio::AudioConfig;
use crate::encoder::video::VideoConfig;

/// Flat string property set with typed getters. Missing keys fall back to
/// the caller-supplied default; present but unparsable values are
/// configuration errors.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    map: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load properties from a JSON object of scalar values.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&text)
            .with_context(|| format!("parse config file {}", path.display()))?;

        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("config file must hold a JSON object"))?;

        let mut properties = Self::new();
        for (key, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(anyhow!(
                        "config key '{}' must be a scalar, got {}",
                        key,
                        other
                    ));
                }
            };
            properties.set(key, text);
        }
        Ok(properties)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> anyhow::Result<T> {
        match self.get(key) {
            None => Ok(default),
            Some(text) => text
                .parse()
                .map_err(|_| anyhow!("config key '{}' has invalid value '{}'", key, text)),
        }
    }
}

/// Fully parsed pipeline configuration. Immutable once built; encoder
/// sessions take their codec parameters from here and never change them
/// afterwards.
#[derive(Debug, Clone)]
pub struct PushConfig {
    // Audio capture and encode
    pub audio_source: AudioSource,
    pub sample_rate: u32,
    pub channels: u16,
    pub audio_bitrate: u64,

    // Video capture and encode
    pub video_source: VideoSource,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub video_bitrate: u64,
    pub gop: u32,
    pub b_frames: u32,
    pub codec: Option<String>,

    // Push session
    pub url: String,
    pub transport: String,
    pub timeout: Duration,
    pub max_queue_duration: Duration,

    /// Optional bound on the control loop's run time
    pub run_duration: Option<Duration>,
}

impl PushConfig {
    pub fn from_properties(properties: &Properties) -> anyhow::Result<Self> {
        let fps = properties.get_parsed("fps", 25u32)?;

        let audio_source = match properties.get_str("audio_source", "device").as_str() {
            "device" => AudioSource::Device,
            "file" => {
                let path = properties
                    .get("audio_file")
                    .ok_or_else(|| anyhow!("audio_source=file requires audio_file"))?;
                AudioSource::File(PathBuf::from(path))
            }
            other => return Err(anyhow!("unknown audio_source '{}'", other)),
        };

        let video_source = match properties.get_str("video_source", "pattern").as_str() {
            "pattern" => VideoSource::Pattern,
            "file" => {
                let path = properties
                    .get("video_file")
                    .ok_or_else(|| anyhow!("video_source=file requires video_file"))?;
                VideoSource::File(PathBuf::from(path))
            }
            other => return Err(anyhow!("unknown video_source '{}'", other)),
        };

        let run_duration = match properties.get_parsed("duration", 0u64)? {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            audio_source,
            sample_rate: properties.get_parsed("sample_rate", 48_000u32)?,
            channels: properties.get_parsed("channels", 2u16)?,
            audio_bitrate: properties.get_parsed("audio_bitrate", 128 * 1024u64)?,

            video_source,
            width: properties.get_parsed("width", 1280u32)?,
            height: properties.get_parsed("height", 720u32)?,
            fps,
            video_bitrate: properties.get_parsed("video_bitrate", 1024 * 1024u64)?,
            gop: properties.get_parsed("gop", fps)?,
            b_frames: properties.get_parsed("b_frames", 0u32)?,
            codec: properties.get("codec_name").map(str::to_string),

            url: properties.get_str("push_url", ""),
            transport: properties.get_str("transport", "tcp"),
            timeout: Duration::from_millis(properties.get_parsed("timeout", 5_000u64)?),
            max_queue_duration: Duration::from_millis(
                properties.get_parsed("max_queue_duration", 500u64)?,
            ),

            run_duration,
        })
    }

    /// Codec configuration for the video session.
    pub fn video_config(&self) -> VideoConfig {
        VideoConfig {
            width: self.width,
            height: self.height,
            fps: self.fps,
            bitrate: self.video_bitrate,
            gop: self.gop,
            b_frames: self.b_frames,
            codec: self.codec.clone(),
        }
    }

    /// Codec configuration for the audio session.
    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bitrate: self.audio_bitrate,
            codec: None,
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}
