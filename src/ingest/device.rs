//! Live camera frame source.
//!
//! This module provides `DeviceSource` for capturing frames from a local camera.
//! Live sources never end on their own; they stop when the pipeline is
//! cancelled, when the device stops delivering frames within the frame
//! timeout, or after `max_frames`.
//!
//! Real devices need the `ingest-v4l2` feature. `stub://` devices produce an
//! endless synthetic scene.

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::synthetic::SyntheticScene;
#[cfg(feature = "ingest-v4l2")]
use super::v4l2::V4l2Capture;
use super::{FrameSource, SourceInfo};
use crate::frame::Frame;
use crate::PipelineError;

/// Configuration for a live device source.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Device path (e.g., "/dev/video0") or `stub://<name>`.
    pub device: String,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
    /// Preferred frame rate.
    pub target_fps: u32,
    /// Longest wait for a frame before the stream counts as exhausted.
    pub frame_timeout: Duration,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
            frame_timeout: Duration::from_millis(2_000),
            max_frames: None,
        }
    }
}

/// Live device frame source.
pub struct DeviceSource {
    config: DeviceConfig,
    backend: Option<DeviceBackend>,
    frames_read: u64,
}

enum DeviceBackend {
    Synthetic(SyntheticScene),
    #[cfg(feature = "ingest-v4l2")]
    V4l2(V4l2Capture),
}

impl DeviceSource {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            backend: None,
            frames_read: 0,
        }
    }

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
}

impl FrameSource for DeviceSource {
    fn describe(&self) -> String {
        format!("device:{}", self.config.device)
    }

    fn open(&mut self) -> Result<SourceInfo> {
        self.frames_read = 0;
        if self.config.device.starts_with("stub://") {
            if self.config.width == 0 || self.config.height == 0 {
                return Err(self.unavailable("synthetic device needs non-zero dimensions"));
            }
            self.backend = Some(DeviceBackend::Synthetic(SyntheticScene::new(
                self.config.width,
                self.config.height,
                0xca3e,
            )));
            log::info!(
                "DeviceSource: connected to {} (synthetic {}x{})",
                self.config.device,
                self.config.width,
                self.config.height
            );
            return Ok(SourceInfo {
                width: self.config.width,
                height: self.config.height,
                fps: self.config.target_fps as f64,
                live: true,
            });
        }

        #[cfg(feature = "ingest-v4l2")]
        {
            let capture = V4l2Capture::open(&self.config)
                .map_err(|err| self.unavailable(format!("{:#}", err)))?;
            let info = capture.info();
            self.backend = Some(DeviceBackend::V4l2(capture));
            Ok(info)
        }
        #[cfg(not(feature = "ingest-v4l2"))]
        {
            Err(self.unavailable("live capture requires the ingest-v4l2 feature"))
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.backend.is_none() {
            return Err(anyhow!("{} is not open", self.describe()));
        }
        if self
            .config
            .max_frames
            .is_some_and(|max| self.frames_read >= max)
        {
            return Ok(None);
        }
        let frame = match self.backend.as_mut() {
            Some(DeviceBackend::Synthetic(scene)) => Some(scene.next_frame()),
            #[cfg(feature = "ingest-v4l2")]
            Some(DeviceBackend::V4l2(capture)) => capture.next_frame()?,
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
                "DeviceSource: released {} after {} frames",
                self.config.device,
                self.frames_read
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> DeviceConfig {
        DeviceConfig {
            device: "stub://test".to_string(),
            width: 64,
            height: 48,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn device_source_produces_live_frames() -> Result<()> {
        let mut source = DeviceSource::new(stub_config());
        let info = source.open()?;
        assert!(info.live);

        for expected in 1..=5 {
            let frame = source.next_frame()?.expect("live stub never ends");
            assert_eq!(frame.sequence, expected);
            assert_eq!((frame.width(), frame.height()), (64, 48));
        }
        source.close();
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[test]
    fn max_frames_ends_live_stream() -> Result<()> {
        let mut source = DeviceSource::new(DeviceConfig {
            max_frames: Some(1),
            ..stub_config()
        });
        source.open()?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        Ok(())
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    #[test]
    fn real_devices_need_v4l2_feature() {
        let mut source = DeviceSource::new(DeviceConfig::default());
        let err = source.open().unwrap_err();
        assert_eq!(
            PipelineError::find(&err).map(|e| e.code()),
            Some("SOURCE_UNAVAILABLE")
        );
    }
}
