//! Frame sinks.
//!
//! Sinks receive annotated frames in capture order, synchronously: a slow sink
//! slows the loop down instead of letting frames queue up in memory.
//!
//! - `ImageSequenceSink`: persistent writer, numbered JPEG frames plus a manifest
//! - `VideoFileSink`: persistent writer, one encoded video (`ingest-file-ffmpeg`)
//! - `MemorySink`: keeps frames in memory (tests, embedding)

use anyhow::{anyhow, Context, Result};
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(feature = "ingest-file-ffmpeg")]
mod video_ffmpeg;

#[cfg(feature = "ingest-file-ffmpeg")]
pub use video_ffmpeg::{VideoFileSink, VIDEO_FILE};

use crate::frame::Frame;
use crate::PipelineError;

/// Which persistent writer to build for the output directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Numbered JPEG frames plus `manifest.json`.
    #[default]
    Images,
    /// One encoded video file. Needs the `ingest-file-ffmpeg` feature.
    Video,
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "images" => Ok(OutputFormat::Images),
            "video" => Ok(OutputFormat::Video),
            other => Err(anyhow!(
                "unknown output format '{}', expected images or video",
                other
            )),
        }
    }
}

/// Build the persistent writer for `format` under `dir`.
pub fn persistent_sink(format: OutputFormat, dir: &Path) -> Result<Box<dyn FrameSink>> {
    match format {
        OutputFormat::Images => Ok(Box::new(ImageSequenceSink::new(dir))),
        #[cfg(feature = "ingest-file-ffmpeg")]
        OutputFormat::Video => Ok(Box::new(VideoFileSink::new(dir.join(VIDEO_FILE)))),
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        OutputFormat::Video => Err(anyhow!(
            "video output requires the ingest-file-ffmpeg feature"
        )),
    }
}

/// Stream metadata a sink needs before the first frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SinkInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// A consumer of annotated frames.
pub trait FrameSink {
    /// Identifier for logs and errors.
    fn name(&self) -> String;

    /// Prepare for frames of the given size and rate.
    fn open(&mut self, info: &SinkInfo) -> Result<()>;

    /// Write one frame. Failures should carry `SinkWriteFailure`.
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and release. Must be safe to call more than once.
    fn close(&mut self) -> Result<()>;

    /// Persistent sinks write an artifact that outlives the run. They are
    /// only opened for non-live sources.
    fn persistent(&self) -> bool {
        false
    }
}

fn write_failure(sink: &str, reason: impl Into<String>) -> anyhow::Error {
    PipelineError::SinkWriteFailure {
        sink: sink.to_string(),
        reason: reason.into(),
    }
    .into()
}

fn check_size(sink: &str, info: Option<&SinkInfo>, frame: &Frame) -> Result<()> {
    let info = info.ok_or_else(|| write_failure(sink, "sink is not open"))?;
    if frame.width() != info.width || frame.height() != info.height {
        return Err(write_failure(
            sink,
            format!(
                "frame {} is {}x{}, sink expects {}x{}",
                frame.sequence,
                frame.width(),
                frame.height(),
                info.width,
                info.height
            ),
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// ImageSequenceSink
// ----------------------------------------------------------------------------

pub const MANIFEST_FILE: &str = "manifest.json";

/// Written next to the frames so the sequence can be re-encoded at the right rate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceManifest {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames: u64,
    pub pattern: String,
}

/// Persistent sink writing `frame_000001.jpg`, `frame_000002.jpg`, ...
pub struct ImageSequenceSink {
    dir: PathBuf,
    info: Option<SinkInfo>,
    written: u64,
}

impl ImageSequenceSink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            info: None,
            written: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frames_written(&self) -> u64 {
        self.written
    }

    fn frame_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("frame_{:06}.jpg", index))
    }

    fn write_manifest(&self, info: &SinkInfo) -> Result<()> {
        let manifest = SequenceManifest {
            width: info.width,
            height: info.height,
            fps: info.fps,
            frames: self.written,
            pattern: "frame_%06d.jpg".to_string(),
        };
        let path = self.dir.join(MANIFEST_FILE);
        let json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))
    }
}

impl FrameSink for ImageSequenceSink {
    fn name(&self) -> String {
        format!("images:{}", self.dir.display())
    }

    fn persistent(&self) -> bool {
        true
    }

    fn open(&mut self, info: &SinkInfo) -> Result<()> {
        if info.width == 0 || info.height == 0 {
            return Err(anyhow!(
                "{} needs non-zero frame dimensions, got {}x{}",
                self.name(),
                info.width,
                info.height
            ));
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating output directory {}", self.dir.display()))?;
        self.written = 0;
        self.write_manifest(info)?;
        self.info = Some(*info);
        log::info!(
            "ImageSequenceSink: writing {}x{} @ {:.2} fps to {}",
            info.width,
            info.height,
            info.fps,
            self.dir.display()
        );
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        let name = self.name();
        check_size(&name, self.info.as_ref(), frame)?;
        let path = self.frame_path(self.written + 1);
        frame
            .image()
            .save_with_format(&path, ImageFormat::Jpeg)
            .map_err(|err| write_failure(&name, format!("{}: {}", path.display(), err)))?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(info) = self.info.take() else {
            return Ok(());
        };
        self.write_manifest(&info)?;
        log::info!(
            "ImageSequenceSink: closed {} after {} frames",
            self.dir.display(),
            self.written
        );
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// MemorySink
// ----------------------------------------------------------------------------

/// Sink that keeps every frame it receives.
#[derive(Default)]
pub struct MemorySink {
    frames: Vec<Frame>,
    info: Option<SinkInfo>,
    opened: bool,
    close_count: u32,
    failures_left: u32,
    write_attempts: u64,
    persistent: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose first `failures` write attempts fail.
    pub fn failing(failures: u32) -> Self {
        Self {
            failures_left: failures,
            ..Self::default()
        }
    }

    /// Report this sink as persistent, like a file writer.
    pub fn marked_persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn info(&self) -> Option<SinkInfo> {
        self.info
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn close_count(&self) -> u32 {
        self.close_count
    }

    pub fn write_attempts(&self) -> u64 {
        self.write_attempts
    }
}

impl FrameSink for MemorySink {
    fn name(&self) -> String {
        "memory".to_string()
    }

    fn persistent(&self) -> bool {
        self.persistent
    }

    fn open(&mut self, info: &SinkInfo) -> Result<()> {
        self.info = Some(*info);
        self.opened = true;
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.write_attempts += 1;
        if !self.opened {
            return Err(write_failure("memory", "sink is not open"));
        }
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(write_failure("memory", "injected failure"));
        }
        self.frames.push(frame.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.opened {
            self.opened = false;
            self.close_count += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(width: u32, height: u32) -> SinkInfo {
        SinkInfo {
            width,
            height,
            fps: 25.0,
        }
    }

    #[test]
    fn image_sequence_writes_frames_and_manifest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("annotated");
        let mut sink = ImageSequenceSink::new(&out);
        sink.open(&info(32, 24))?;
        sink.write(&Frame::filled(1, 32, 24, [0, 255, 0]))?;
        sink.write(&Frame::filled(2, 32, 24, [255, 0, 0]))?;
        sink.close()?;
        sink.close()?;

        assert!(out.join("frame_000001.jpg").exists());
        assert!(out.join("frame_000002.jpg").exists());
        let manifest: SequenceManifest =
            serde_json::from_slice(&fs::read(out.join(MANIFEST_FILE))?)?;
        assert_eq!(manifest.frames, 2);
        assert_eq!((manifest.width, manifest.height), (32, 24));
        assert_eq!(manifest.fps, 25.0);

        let decoded = image::open(out.join("frame_000001.jpg"))?;
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
        Ok(())
    }

    #[test]
    fn image_sequence_rejects_mismatched_frames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = ImageSequenceSink::new(dir.path());
        sink.open(&info(32, 24))?;
        let err = sink.write(&Frame::filled(1, 16, 16, [0, 0, 0])).unwrap_err();
        assert_eq!(
            PipelineError::find(&err).map(|e| e.code()),
            Some("SINK_WRITE_FAILURE")
        );
        assert_eq!(sink.frames_written(), 0);
        Ok(())
    }

    #[test]
    fn writing_before_open_fails() {
        let mut sink = ImageSequenceSink::new("unused");
        assert!(sink.write(&Frame::filled(1, 2, 2, [0, 0, 0])).is_err());
    }

    #[test]
    fn memory_sink_injects_failures() -> Result<()> {
        let mut sink = MemorySink::failing(1);
        sink.open(&info(4, 4))?;
        let frame = Frame::filled(1, 4, 4, [0, 0, 0]);
        assert!(sink.write(&frame).is_err());
        sink.write(&frame)?;
        assert_eq!(sink.frames().len(), 1);
        assert_eq!(sink.write_attempts(), 2);
        sink.close()?;
        assert_eq!(sink.close_count(), 1);
        Ok(())
    }

    #[test]
    fn output_format_parses_names() {
        assert_eq!("Images".parse::<OutputFormat>().unwrap(), OutputFormat::Images);
        assert_eq!(" video ".parse::<OutputFormat>().unwrap(), OutputFormat::Video);
        assert!("gif".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn persistent_sinks_report_themselves() -> Result<()> {
        let sink = persistent_sink(OutputFormat::Images, Path::new("annotated"))?;
        assert!(sink.persistent());
        assert_eq!(sink.name(), "images:annotated");
        assert!(!MemorySink::new().persistent());
        assert!(MemorySink::new().marked_persistent().persistent());
        Ok(())
    }

    #[cfg(feature = "ingest-file-ffmpeg")]
    #[test]
    fn video_format_builds_a_video_sink() -> Result<()> {
        let sink = persistent_sink(OutputFormat::Video, Path::new("annotated"))?;
        assert!(sink.persistent());
        assert!(sink.name().ends_with(VIDEO_FILE));
        Ok(())
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    #[test]
    fn video_format_needs_ffmpeg_feature() {
        let err = persistent_sink(OutputFormat::Video, Path::new("annotated"))
            .err()
            .expect("video sink should fail without ffmpeg feature");
        assert!(err.to_string().contains("ingest-file-ffmpeg"));
    }
}
