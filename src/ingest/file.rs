//! Local file frame source.
//!
//! This module provides `FileSource` for reading frames from local video files.
//! The file source is responsible for:
//! - Opening a local file (no URL schemes other than `stub://`)
//! - Decoding frames in-memory, in file order
//! - Reporting width, height and rate for output writers
//! - Signalling end of file as exhaustion, distinct from open failure
//!
//! Real files need the `ingest-file-ffmpeg` feature. `stub://` paths produce a
//! finite synthetic scene for tests and dry runs.

use anyhow::{anyhow, Result};
use std::time::Duration;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::synthetic::SyntheticScene;
use super::{FrameSource, SourceInfo};
use crate::frame::Frame;
use crate::PipelineError;

/// Frames a `stub://` file yields when no limit is configured.
const SYNTHETIC_FILE_FRAMES: u64 = 90;

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local file path (e.g., "./input1.mp4") or `stub://<name>`.
    pub path: String,
    /// Synthetic scene width.
    pub width: u32,
    /// Synthetic scene height.
    pub height: u32,
    /// Synthetic scene rate; real files report their own.
    pub target_fps: u32,
    /// Longest decode stall before the file counts as exhausted.
    pub frame_timeout: Duration,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            width: 1280,
            height: 720,
            target_fps: 30,
            frame_timeout: Duration::from_millis(2_000),
            max_frames: None,
        }
    }
}

/// Local file frame source.
pub struct FileSource {
    config: FileConfig,
    backend: Option<FileBackend>,
    frames_read: u64,
}

enum FileBackend {
    Synthetic(SyntheticScene),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Self {
        Self {
            config,
            backend: None,
            frames_read: 0,
        }
    }

    /// Frames returned since open.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    fn unavailable(&self, reason: impl Into<String>) -> anyhow::Error {
        PipelineError::SourceUnavailable {
            source: self.describe(),
            reason: reason.into(),
        }
        .into()
    }

    fn limit_reached(&self) -> bool {
        let synthetic_default = match &self.backend {
            Some(FileBackend::Synthetic(_)) => Some(SYNTHETIC_FILE_FRAMES),
            _ => None,
        };
        self.config
            .max_frames
            .or(synthetic_default)
            .is_some_and(|max| self.frames_read >= max)
    }
}

impl FrameSource for FileSource {
    fn describe(&self) -> String {
        format!("file:{}", self.config.path)
    }

    fn open(&mut self) -> Result<SourceInfo> {
        if !is_local_file_path(&self.config.path) {
            return Err(self.unavailable("file ingestion only supports local paths (no URL schemes)"));
        }
        self.frames_read = 0;

        if self.config.path.starts_with("stub://") {
            if self.config.width == 0 || self.config.height == 0 {
                return Err(self.unavailable("synthetic scene needs non-zero dimensions"));
            }
            self.backend = Some(FileBackend::Synthetic(SyntheticScene::new(
                self.config.width,
                self.config.height,
                0x5eed,
            )));
            log::info!(
                "FileSource: opened {} (synthetic {}x{} @ {} fps)",
                self.config.path,
                self.config.width,
                self.config.height,
                self.config.target_fps
            );
            return Ok(SourceInfo {
                width: self.config.width,
                height: self.config.height,
                fps: self.config.target_fps as f64,
                live: false,
            });
        }

        #[cfg(feature = "ingest-file-ffmpeg")]
        {
            let source = FfmpegFileSource::open(&self.config)
                .map_err(|err| self.unavailable(format!("{:#}", err)))?;
            let info = source.info();
            self.backend = Some(FileBackend::Ffmpeg(source));
            log::info!(
                "FileSource: opened {} ({}x{} @ {:.2} fps)",
                self.config.path,
                info.width,
                info.height,
                info.fps
            );
            Ok(info)
        }
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            Err(self.unavailable("file ingestion requires the ingest-file-ffmpeg feature"))
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.backend.is_none() {
            return Err(anyhow!("{} is not open", self.describe()));
        }
        if self.limit_reached() {
            return Ok(None);
        }
        let frame = match self.backend.as_mut() {
            Some(FileBackend::Synthetic(scene)) => Some(scene.next_frame()),
            #[cfg(feature = "ingest-file-ffmpeg")]
            Some(FileBackend::Ffmpeg(source)) => source.next_frame()?,
            None => None,
        };
        if frame.is_some() {
            self.frames_read += 1;
        }
        Ok(frame)
    }

    fn close(&mut self) {
        if self.backend.take().is_some() {
            log::info!(
                "FileSource: closed {} after {} frames",
                self.config.path,
                self.frames_read
            );
        }
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(max_frames: Option<u64>) -> FileConfig {
        FileConfig {
            path: "stub://clip".to_string(),
            width: 64,
            height: 48,
            max_frames,
            ..FileConfig::default()
        }
    }

    #[test]
    fn synthetic_file_is_finite() -> Result<()> {
        let mut source = FileSource::new(stub_config(None));
        source.open()?;
        let mut count = 0;
        while let Some(frame) = source.next_frame()? {
            count += 1;
            assert_eq!(frame.sequence, count);
        }
        assert_eq!(count, SYNTHETIC_FILE_FRAMES);
        source.close();
        Ok(())
    }

    #[test]
    fn max_frames_caps_the_stream() -> Result<()> {
        let mut source = FileSource::new(stub_config(Some(3)));
        let info = source.open()?;
        assert_eq!((info.width, info.height), (64, 48));
        assert!(!info.live);
        for _ in 0..3 {
            assert!(source.next_frame()?.is_some());
        }
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.frames_read(), 3);
        Ok(())
    }

    #[test]
    fn remote_urls_are_unavailable() {
        let mut source = FileSource::new(FileConfig {
            path: "http://camera/stream.mp4".to_string(),
            ..FileConfig::default()
        });
        let err = source.open().unwrap_err();
        assert_eq!(
            PipelineError::find(&err).map(|e| e.code()),
            Some("SOURCE_UNAVAILABLE")
        );
    }

    #[test]
    fn reading_before_open_is_an_error() {
        let mut source = FileSource::new(stub_config(None));
        assert!(source.next_frame().is_err());
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    #[test]
    fn real_files_need_ffmpeg_feature() {
        let mut source = FileSource::new(FileConfig {
            path: "./input1.mp4".to_string(),
            ..FileConfig::default()
        });
        let err = source.open().unwrap_err();
        assert!(err.to_string().contains("ingest-file-ffmpeg"));
    }
}
