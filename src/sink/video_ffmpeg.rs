//! Persistent writer that encodes annotated frames into one video file.
//!
//! Frames are converted from RGB24 to YUV420P and encoded as MPEG-4 Part 2,
//! which FFmpeg ships without external codec libraries. The container is
//! chosen from the file extension.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::path::{Path, PathBuf};

use super::{check_size, write_failure, FrameSink, SinkInfo};
use crate::frame::Frame;

/// Default file name inside the output directory.
pub const VIDEO_FILE: &str = "output_distance_detection.mp4";

pub struct VideoFileSink {
    path: PathBuf,
    info: Option<SinkInfo>,
    encoding: Option<Encoding>,
    written: u64,
}

struct Encoding {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: ffmpeg::software::scaling::Context,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
}

impl VideoFileSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            info: None,
            encoding: None,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.written
    }

    fn start(&self, info: &SinkInfo) -> Result<Encoding> {
        ffmpeg::init().context("initialize ffmpeg")?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating output directory {}", parent.display()))?;
        }

        let mut output = ffmpeg::format::output(&self.path)
            .with_context(|| format!("open video output {}", self.path.display()))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| anyhow!("ffmpeg was built without an MPEG-4 encoder"))?;
        let frame_rate = ffmpeg::Rational::from(info.fps);
        let encoder_time_base = frame_rate.invert();

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create ffmpeg video encoder")?;
        encoder.set_width(info.width);
        encoder.set_height(info.height);
        encoder.set_format(ffmpeg::util::format::pixel::Pixel::YUV420P);
        encoder.set_time_base(encoder_time_base);
        encoder.set_frame_rate(Some(frame_rate));
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder.open_as(codec).context("open ffmpeg video encoder")?;

        {
            let mut stream = output
                .add_stream(codec)
                .context("add video stream to output")?;
            stream.set_parameters(&encoder);
            stream.set_time_base(encoder_time_base);
        }
        output
            .write_header()
            .with_context(|| format!("write header of {}", self.path.display()))?;
        let stream_time_base = output
            .stream(0)
            .map(|stream| stream.time_base())
            .ok_or_else(|| anyhow!("video stream missing after header"))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            ffmpeg::util::format::pixel::Pixel::RGB24,
            info.width,
            info.height,
            ffmpeg::util::format::pixel::Pixel::YUV420P,
            info.width,
            info.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Encoding {
            output,
            encoder,
            scaler,
            encoder_time_base,
            stream_time_base,
        })
    }
}

impl Encoding {
    fn encode(&mut self, frame: &Frame, pts: i64) -> Result<()> {
        let mut rgb = ffmpeg::frame::Video::new(
            ffmpeg::util::format::pixel::Pixel::RGB24,
            frame.width(),
            frame.height(),
        );
        pixels_to_frame(frame, &mut rgb)?;

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&rgb, &mut yuv)
            .context("scale frame to YUV420P")?;
        yuv.set_pts(Some(pts));
        self.encoder
            .send_frame(&yuv)
            .context("send frame to encoder")?;
        self.drain()
    }

    fn finish(&mut self) -> Result<()> {
        self.encoder.send_eof().context("flush ffmpeg encoder")?;
        self.drain()?;
        self.output.write_trailer().context("write video trailer")
    }

    fn drain(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(0);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .context("write encoded packet")?;
        }
        Ok(())
    }
}

fn pixels_to_frame(frame: &Frame, target: &mut ffmpeg::frame::Video) -> Result<()> {
    let row_bytes = frame.width() as usize * 3;
    let stride = target.stride(0);
    let data = target.data_mut(0);
    for (row, src) in frame.pixels().chunks_exact(row_bytes).enumerate() {
        let start = row * stride;
        data.get_mut(start..start + row_bytes)
            .ok_or_else(|| anyhow!("ffmpeg frame row {} is out of bounds", row))?
            .copy_from_slice(src);
    }
    Ok(())
}

impl FrameSink for VideoFileSink {
    fn name(&self) -> String {
        format!("video:{}", self.path.display())
    }

    fn persistent(&self) -> bool {
        true
    }

    fn open(&mut self, info: &SinkInfo) -> Result<()> {
        if info.width == 0 || info.height == 0 || info.width % 2 != 0 || info.height % 2 != 0 {
            return Err(anyhow!(
                "{} needs even, non-zero frame dimensions, got {}x{}",
                self.name(),
                info.width,
                info.height
            ));
        }
        self.encoding = Some(self.start(info)?);
        self.info = Some(*info);
        self.written = 0;
        log::info!(
            "VideoFileSink: encoding {}x{} @ {:.2} fps to {}",
            info.width,
            info.height,
            info.fps,
            self.path.display()
        );
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        let name = self.name();
        check_size(&name, self.info.as_ref(), frame)?;
        let pts = self.written as i64;
        let encoding = self
            .encoding
            .as_mut()
            .ok_or_else(|| write_failure(&name, "sink is not open"))?;
        encoding
            .encode(frame, pts)
            .map_err(|err| write_failure(&name, format!("{:#}", err)))?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.info = None;
        let Some(mut encoding) = self.encoding.take() else {
            return Ok(());
        };
        encoding.finish()?;
        log::info!(
            "VideoFileSink: closed {} after {} frames",
            self.path.display(),
            self.written
        );
        Ok(())
    }
}
