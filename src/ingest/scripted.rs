//! In-memory frame source.
//!
//! Plays back a fixed list of frames and decode failures, in order. Useful for
//! tests and for embedding the pipeline behind another capture stack.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use super::{FrameSource, SourceInfo};
use crate::frame::Frame;
use crate::PipelineError;

enum ScriptedItem {
    Frame(Frame),
    Corrupt(String),
}

/// Scripted frame source.
pub struct ScriptedSource {
    name: String,
    info: SourceInfo,
    items: VecDeque<ScriptedItem>,
    open_error: Option<String>,
    open: bool,
    open_count: u32,
    close_count: u32,
    frames_read: u64,
}

impl ScriptedSource {
    pub fn new(name: &str, width: u32, height: u32, fps: f64) -> Self {
        Self {
            name: name.to_string(),
            info: SourceInfo {
                width,
                height,
                fps,
                live: false,
            },
            items: VecDeque::new(),
            open_error: None,
            open: false,
            open_count: 0,
            close_count: 0,
            frames_read: 0,
        }
    }

    /// `count` solid frames, numbered from 1, each a slightly different shade.
    pub fn with_frames(name: &str, width: u32, height: u32, count: u64) -> Self {
        let mut source = Self::new(name, width, height, 30.0);
        for seq in 1..=count {
            let shade = (seq * 16 % 256) as u8;
            source.push_frame(Frame::filled(seq, width, height, [shade, shade, shade]));
        }
        source
    }

    /// A source whose `open` always fails.
    pub fn unavailable(name: &str, reason: &str) -> Self {
        let mut source = Self::new(name, 0, 0, 0.0);
        source.open_error = Some(reason.to_string());
        source
    }

    /// Report the stream as a live device.
    pub fn live(mut self) -> Self {
        self.info.live = true;
        self
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.items.push_back(ScriptedItem::Frame(frame));
    }

    /// Queue a frame that fails to decode.
    pub fn push_corrupt(&mut self, reason: &str) {
        self.items.push_back(ScriptedItem::Corrupt(reason.to_string()));
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn close_count(&self) -> u32 {
        self.close_count
    }

    /// Items pulled so far, including corrupt ones.
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

impl FrameSource for ScriptedSource {
    fn describe(&self) -> String {
        format!("scripted:{}", self.name)
    }

    fn open(&mut self) -> Result<SourceInfo> {
        self.open_count += 1;
        if let Some(reason) = &self.open_error {
            return Err(PipelineError::SourceUnavailable {
                source: self.describe(),
                reason: reason.clone(),
            }
            .into());
        }
        self.open = true;
        Ok(self.info)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            return Err(anyhow!("{} is not open", self.describe()));
        }
        let Some(item) = self.items.pop_front() else {
            return Ok(None);
        };
        self.frames_read += 1;
        match item {
            ScriptedItem::Frame(frame) => Ok(Some(frame)),
            ScriptedItem::Corrupt(reason) => {
                Err(PipelineError::FrameDecodeFailure { reason }.into())
            }
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.close_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plays_frames_then_exhausts() -> Result<()> {
        let mut source = ScriptedSource::with_frames("clip", 8, 6, 2);
        let info = source.open()?;
        assert_eq!((info.width, info.height), (8, 6));

        assert_eq!(source.next_frame()?.map(|f| f.sequence), Some(1));
        assert_eq!(source.next_frame()?.map(|f| f.sequence), Some(2));
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.frames_read(), 2);

        source.close();
        source.close();
        assert_eq!(source.close_count(), 1);
        Ok(())
    }

    #[test]
    fn corrupt_items_surface_as_decode_failures() -> Result<()> {
        let mut source = ScriptedSource::new("clip", 4, 4, 10.0);
        source.push_corrupt("bad header");
        source.push_frame(Frame::filled(2, 4, 4, [1, 1, 1]));
        source.open()?;

        let err = source.next_frame().unwrap_err();
        assert_eq!(
            PipelineError::find(&err).map(|e| e.code()),
            Some("FRAME_DECODE_FAILURE")
        );
        assert!(source.next_frame()?.is_some());
        Ok(())
    }

    #[test]
    fn unavailable_source_fails_to_open() {
        let mut source = ScriptedSource::unavailable("cam", "no such file");
        let err = source.open().unwrap_err();
        assert_eq!(
            PipelineError::find(&err).map(|e| e.code()),
            Some("SOURCE_UNAVAILABLE")
        );
        assert!(!source.is_open());
    }
}
