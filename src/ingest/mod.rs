//! Frame ingestion sources.
//!
//! This module provides different sources for frames:
//! - Local video files (`ingest-file-ffmpeg`), with synthetic `stub://` scenes
//! - Live camera devices (`ingest-v4l2`), with synthetic `stub://` devices
//! - Scripted in-memory sources (tests, embedding)
//!
//! Every source reports open failure distinctly from end of stream:
//! `open` fails when the source cannot be acquired, and `next_frame` returns
//! `Ok(None)` once the stream is exhausted. A frame that cannot be decoded is
//! an `Err` from `next_frame`; the pipeline decides whether to skip it.
//!
//! Sources MUST NOT:
//! - Buffer frames ahead of the consumer
//! - Block on acquisition beyond their configured frame timeout

pub mod device;
pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
mod normalize;
pub mod scripted;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub(crate) mod v4l2;

use anyhow::{anyhow, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::frame::Frame;

pub use device::{DeviceConfig, DeviceSource};
pub use file::{FileConfig, FileSource};
pub use scripted::ScriptedSource;

/// Stream metadata reported when a source opens.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Nominal frame rate of the stream.
    pub fps: f64,
    /// True for live devices. Persistent output is only written for non-live sources.
    pub live: bool,
}

/// A producer of frames in capture order.
pub trait FrameSource {
    /// Human-readable identifier for logs and errors.
    fn describe(&self) -> String;

    /// Acquire the underlying stream.
    fn open(&mut self) -> Result<SourceInfo>;

    /// Next frame, `Ok(None)` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying stream. Must be safe to call more than once.
    fn close(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn open(&mut self) -> Result<SourceInfo> {
        (**self).open()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Where frames come from: a file path or a live device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceSpec {
    File(String),
    Device(String),
}

impl SourceSpec {
    /// Parse a source string.
    ///
    /// A bare integer (`"0"`), a `device:<path-or-index>` prefix, or a
    /// `/dev/video*` path selects a live device. Anything else is a file path.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("source must not be empty"));
        }
        if let Some(rest) = raw.strip_prefix("device:") {
            let rest = rest.trim();
            if rest.is_empty() {
                return Err(anyhow!("device source needs a path or index"));
            }
            return Ok(SourceSpec::Device(device_path(rest)));
        }
        if raw.chars().all(|c| c.is_ascii_digit()) || raw.starts_with("/dev/video") {
            return Ok(SourceSpec::Device(device_path(raw)));
        }
        Ok(SourceSpec::File(raw.to_string()))
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SourceSpec::Device(_))
    }

    pub fn location(&self) -> &str {
        match self {
            SourceSpec::File(path) | SourceSpec::Device(path) => path,
        }
    }
}

impl FromStr for SourceSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceSpec::File(path) => write!(f, "file:{}", path),
            SourceSpec::Device(path) => write!(f, "device:{}", path),
        }
    }
}

fn device_path(raw: &str) -> String {
    if raw.chars().all(|c| c.is_ascii_digit()) {
        format!("/dev/video{}", raw)
    } else {
        raw.to_string()
    }
}

/// Settings shared by the built-in sources.
#[derive(Clone, Debug)]
pub struct SourceSettings {
    /// Preferred capture width (devices, synthetic scenes).
    pub width: u32,
    /// Preferred capture height (devices, synthetic scenes).
    pub height: u32,
    /// Preferred capture rate.
    pub fps: u32,
    /// Longest wait for a frame before the stream counts as exhausted.
    pub frame_timeout: Duration,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            frame_timeout: Duration::from_millis(2_000),
            max_frames: None,
        }
    }
}

/// Build the source a spec names. Acquisition happens later, in `open`.
pub fn source_for(spec: &SourceSpec, settings: &SourceSettings) -> Box<dyn FrameSource> {
    match spec {
        SourceSpec::File(path) => Box::new(FileSource::new(FileConfig {
            path: path.clone(),
            width: settings.width,
            height: settings.height,
            target_fps: settings.fps,
            frame_timeout: settings.frame_timeout,
            max_frames: settings.max_frames,
        })),
        SourceSpec::Device(device) => Box::new(DeviceSource::new(DeviceConfig {
            device: device.clone(),
            width: settings.width,
            height: settings.height,
            target_fps: settings.fps,
            frame_timeout: settings.frame_timeout,
            max_frames: settings.max_frames,
        })),
    }
}
