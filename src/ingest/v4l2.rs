//! V4L2 capture backend for `DeviceSource`.
//!
//! Negotiates RGB24 when the driver offers it and falls back to YUYV or NV12,
//! converting in-memory. A capture error that reports a timeout ends the
//! stream; any other capture error is a per-frame decode failure.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::io::ErrorKind;

use super::device::DeviceConfig;
use super::normalize::{normalize_to_rgb, PixelFormat};
use super::SourceInfo;
use crate::frame::Frame;
use crate::PipelineError;

pub(crate) struct V4l2Capture {
    config: DeviceConfig,
    state: V4l2State,
    format: PixelFormat,
    width: u32,
    height: u32,
    frame_count: u64,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Capture {
    pub(crate) fn open(config: &DeviceConfig) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&config.device)
            .with_context(|| format!("open v4l2 device {}", config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "DeviceSource: failed to set RGB3 on {}: {}",
                    config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        let pixel_format = match &format.fourcc.repr {
            b"RGB3" => PixelFormat::Rgb24,
            b"YUYV" => PixelFormat::Yuyv,
            b"NV12" => PixelFormat::Nv12,
            other => {
                return Err(anyhow!(
                    "unsupported v4l2 pixel format {}",
                    String::from_utf8_lossy(other)
                ))
            }
        };

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "DeviceSource: failed to set fps on {}: {}",
                    config.device,
                    err
                );
            }
        }

        let frame_timeout = config.frame_timeout;
        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                let mut stream =
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| {
                            anyhow::Error::new(err).context("create v4l2 buffer stream")
                        })?;
                stream.set_timeout(frame_timeout);
                Ok::<_, anyhow::Error>(stream)
            },
        }
        .try_build()?;

        log::info!(
            "DeviceSource: connected to {} ({}x{} {:?})",
            config.device,
            format.width,
            format.height,
            pixel_format
        );

        Ok(Self {
            config: config.clone(),
            state,
            format: pixel_format,
            width: format.width,
            height: format.height,
            frame_count: 0,
        })
    }

    pub(crate) fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.width,
            height: self.height,
            fps: self.config.target_fps as f64,
            live: true,
        }
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let captured = self
            .state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()));
        let buf = match captured {
            Ok(buf) => buf,
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                log::warn!(
                    "DeviceSource: no frame from {} within timeout; ending stream",
                    self.config.device
                );
                return Ok(None);
            }
            Err(err) => {
                return Err(PipelineError::FrameDecodeFailure {
                    reason: format!("capture v4l2 frame: {}", err),
                }
                .into())
            }
        };

        let rgb = normalize_to_rgb(&buf, self.width, self.height, self.format)?;
        self.frame_count += 1;
        Frame::from_rgb(self.frame_count, rgb, self.width, self.height).map(Some)
    }
}
