//! The frame loop.
//!
//! States: `Idle -> Running -> (Draining | Failed) -> Stopped`.
//!
//! One frame at a time, in capture order: pull, resize to the processing
//! resolution, detect, filter by confidence, estimate distances, annotate,
//! overlay throughput, emit to every sink. The stop signal is checked once per
//! cycle. Source and sinks are released on every exit path, including errors.
//! Persistent sinks are not opened when the source reports itself live.
//!
//! While `run` is active the focal length is frozen; calibrating from another
//! handle fails with `CalibrationLocked`.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::annotate::{format_rate, FrameAnnotator};
use crate::calibration::FocalCalibrator;
use crate::detect::{Detection, DetectorBackend};
use crate::distance::DistanceModel;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::sink::{FrameSink, SinkInfo};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_PROCESSING_WIDTH: u32 = 640;
pub const DEFAULT_PROCESSING_HEIGHT: u32 = 480;
pub const DEFAULT_MAX_CONSECUTIVE_FRAME_FAILURES: u32 = 30;
/// Declared to sinks when the source does not report a usable rate.
pub const FALLBACK_OUTPUT_FPS: f64 = 30.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    /// Terminal. The run could not start or was aborted by a fatal error.
    Failed,
    /// Terminal. The run completed or was cancelled.
    Stopped,
}

/// What to do with a frame that cannot be decoded or detected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramePolicy {
    #[default]
    Skip,
    Strict,
}

/// What to do when a sink rejects a frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkFailurePolicy {
    /// Retry the write once, then fail the run.
    #[default]
    RetryOnce,
    Fail,
    /// Drop the frame for that sink and continue.
    Skip,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    /// Detections below this confidence are discarded before estimation.
    pub confidence_threshold: f32,
    pub processing_width: u32,
    pub processing_height: u32,
    pub frame_policy: FramePolicy,
    pub sink_policy: SinkFailurePolicy,
    /// Past this many decode failures in a row the stream counts as exhausted.
    pub max_consecutive_frame_failures: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            processing_width: DEFAULT_PROCESSING_WIDTH,
            processing_height: DEFAULT_PROCESSING_HEIGHT,
            frame_policy: FramePolicy::Skip,
            sink_policy: SinkFailurePolicy::RetryOnce,
            max_consecutive_frame_failures: DEFAULT_MAX_CONSECUTIVE_FRAME_FAILURES,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.processing_width == 0 || self.processing_height == 0 {
            return Err(anyhow!(
                "processing resolution must be non-zero, got {}x{}",
                self.processing_width,
                self.processing_height
            ));
        }
        Ok(())
    }
}

/// Cooperative cancellation flag shared between the loop and its controller.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Trigger on Ctrl-C. Only one handler may be installed per process.
    pub fn install_ctrlc(&self) -> Result<()> {
        let flag = Arc::clone(&self.0);
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))
    }
}

/// Result of processing one frame.
#[derive(Clone, Debug)]
pub struct FrameOutcome {
    /// Annotated copy at the processing resolution.
    pub frame: Frame,
    /// Detections that passed the threshold, with their distance in cm.
    pub estimates: Vec<(Detection, f64)>,
    pub below_threshold: usize,
    pub invalid_geometry: usize,
    /// Detect-and-estimate rate; `None` when the elapsed time was not measurable.
    pub rate: Option<f64>,
}

/// Counters for one call to `Pipeline::run`.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub final_state: PipelineState,
    /// Frames successfully pulled from the source.
    pub frames_read: u64,
    /// Frames annotated and handed to the sinks.
    pub frames_processed: u64,
    /// Frames dropped because they could not be decoded or detected.
    pub frames_skipped: u64,
    /// Individual sink writes dropped under `SinkFailurePolicy::Skip`.
    pub sink_writes_skipped: u64,
    /// Persistent sinks left closed because the source is live.
    pub persistent_sinks_suppressed: usize,
    pub detections_below_threshold: u64,
    pub detections_invalid_geometry: u64,
    pub last_rate: Option<f64>,
}

impl Default for RunReport {
    fn default() -> Self {
        Self {
            final_state: PipelineState::Idle,
            frames_read: 0,
            frames_processed: 0,
            frames_skipped: 0,
            sink_writes_skipped: 0,
            persistent_sinks_suppressed: 0,
            detections_below_threshold: 0,
            detections_invalid_geometry: 0,
            last_rate: None,
        }
    }
}

pub struct Pipeline {
    detector: Box<dyn DetectorBackend>,
    model: DistanceModel,
    annotator: FrameAnnotator,
    settings: PipelineSettings,
    state: PipelineState,
    stop: StopSignal,
    report: RunReport,
}

impl Pipeline {
    pub fn new(
        detector: Box<dyn DetectorBackend>,
        model: DistanceModel,
        annotator: FrameAnnotator,
        settings: PipelineSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            detector,
            model,
            annotator,
            settings,
            state: PipelineState::Idle,
            stop: StopSignal::new(),
            report: RunReport::default(),
        })
    }

    /// Share an externally owned stop signal.
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn model(&self) -> &DistanceModel {
        &self.model
    }

    /// For wholesale reconfiguration between runs.
    pub fn model_mut(&mut self) -> &mut DistanceModel {
        &mut self.model
    }

    pub fn calibrator(&self) -> &FocalCalibrator {
        self.model.calibrator()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    /// Counters of the current or most recent run.
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Detect, estimate and annotate a single frame. The input is not modified.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<FrameOutcome> {
        let processed = frame.resized(self.settings.processing_width, self.settings.processing_height);

        let started = Instant::now();
        let detections = self.detector.detect(&processed)?;
        let mut estimates = Vec::with_capacity(detections.len());
        let mut below_threshold = 0;
        let mut invalid_geometry = 0;
        for detection in detections {
            // NaN confidences fail this comparison too.
            if !(detection.confidence >= self.settings.confidence_threshold) {
                below_threshold += 1;
                continue;
            }
            let apparent_width = f64::from(detection.bbox.x2 - detection.bbox.x1);
            match self.model.estimate_distance(apparent_width, &detection.label) {
                Ok(distance) => estimates.push((detection, distance)),
                Err(err) => {
                    invalid_geometry += 1;
                    log::warn!(
                        "frame {}: skipping {} detection: {}",
                        frame.sequence,
                        detection.label,
                        err
                    );
                }
            }
        }
        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { Some(1.0 / elapsed) } else { None };

        let annotated = self.annotator.annotate(&processed, &estimates);
        let annotated = self.annotator.overlay(&annotated, &format_rate(rate));

        log::debug!(
            "frame {}: {} estimates, {} below threshold, {}",
            frame.sequence,
            estimates.len(),
            below_threshold,
            format_rate(rate)
        );

        Ok(FrameOutcome {
            frame: annotated,
            estimates,
            below_threshold,
            invalid_geometry,
            rate,
        })
    }

    /// Drive `source` to exhaustion, cancellation, or a fatal error.
    ///
    /// Fatal errors leave the pipeline in `Failed` and are returned after the
    /// source and sinks have been closed; `report()` still holds the counters.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        sinks: &mut [&mut dyn FrameSink],
    ) -> Result<RunReport> {
        self.report = RunReport::default();
        self.state = PipelineState::Idle;
        let _freeze = self.model.calibrator().freeze();

        let mut source = SourceGuard { source };
        let info = match source.source.open() {
            Ok(info) => info,
            Err(err) => return Err(self.fail(err)),
        };

        let sink_info = SinkInfo {
            width: self.settings.processing_width,
            height: self.settings.processing_height,
            fps: if info.fps.is_finite() && info.fps > 0.0 {
                info.fps
            } else {
                FALLBACK_OUTPUT_FPS
            },
        };
        let mut sinks = SinkSet::new(sinks);
        match sinks.open_all(&sink_info, info.live) {
            Ok(suppressed) => self.report.persistent_sinks_suppressed = suppressed,
            Err(err) => return Err(self.fail(err)),
        }

        self.transition(PipelineState::Running);
        if let Err(err) = self.detector.warm_up() {
            log::warn!("detector {} warm-up failed: {:#}", self.detector.name(), err);
        }

        if let Err(err) = self.drive(&mut *source.source, &mut sinks) {
            return Err(self.fail(err));
        }

        self.transition(PipelineState::Draining);
        if let Err(err) = sinks.close_all() {
            return Err(self.fail(err));
        }
        source.source.close();
        self.transition(PipelineState::Stopped);

        let report = &self.report;
        log::info!(
            "run finished: {} frames read, {} processed, {} skipped, {} detections below threshold, {} invalid",
            report.frames_read,
            report.frames_processed,
            report.frames_skipped,
            report.detections_below_threshold,
            report.detections_invalid_geometry
        );
        Ok(self.report.clone())
    }

    fn drive(&mut self, source: &mut dyn FrameSource, sinks: &mut SinkSet<'_, '_>) -> Result<()> {
        let mut consecutive_failures = 0u32;
        loop {
            if self.stop.is_set() {
                log::info!("stop signal received; draining");
                return Ok(());
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::info!("{} exhausted", source.describe());
                    return Ok(());
                }
                Err(err) => {
                    self.frame_failed(err)?;
                    consecutive_failures += 1;
                    if consecutive_failures > self.settings.max_consecutive_frame_failures {
                        log::warn!(
                            "{} failed {} frames in a row; treating as exhausted",
                            source.describe(),
                            consecutive_failures
                        );
                        return Ok(());
                    }
                    continue;
                }
            };
            consecutive_failures = 0;
            self.report.frames_read += 1;

            let outcome = match self.process_frame(&frame) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.frame_failed(err.context(format!("frame {}", frame.sequence)))?;
                    continue;
                }
            };
            self.report.detections_below_threshold += outcome.below_threshold as u64;
            self.report.detections_invalid_geometry += outcome.invalid_geometry as u64;
            self.report.last_rate = outcome.rate;

            self.report.sink_writes_skipped +=
                sinks.write_all(&outcome.frame, self.settings.sink_policy)?;
            self.report.frames_processed += 1;
        }
    }

    /// Apply the frame policy to a per-frame error.
    fn frame_failed(&mut self, err: anyhow::Error) -> Result<()> {
        match self.settings.frame_policy {
            FramePolicy::Skip => {
                self.report.frames_skipped += 1;
                log::warn!("skipping frame: {:#}", err);
                Ok(())
            }
            FramePolicy::Strict => Err(err),
        }
    }

    fn transition(&mut self, next: PipelineState) {
        log::info!("pipeline {:?} -> {:?}", self.state, next);
        self.state = next;
        self.report.final_state = next;
    }

    fn fail(&mut self, err: anyhow::Error) -> anyhow::Error {
        log::error!("pipeline failed: {:#}", err);
        self.transition(PipelineState::Failed);
        err
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("detector", &self.detector.name())
            .field("state", &self.state)
            .field("settings", &self.settings)
            .finish()
    }
}

/// Closes the source when dropped.
struct SourceGuard<'a> {
    source: &'a mut dyn FrameSource,
}

impl Drop for SourceGuard<'_> {
    fn drop(&mut self) {
        self.source.close();
    }
}

/// Tracks which sinks were opened and closes them when dropped.
struct SinkSet<'a, 'b> {
    sinks: &'a mut [&'b mut dyn FrameSink],
    open: Vec<bool>,
}

impl<'a, 'b> SinkSet<'a, 'b> {
    fn new(sinks: &'a mut [&'b mut dyn FrameSink]) -> Self {
        let open = vec![false; sinks.len()];
        Self { sinks, open }
    }

    /// Open every sink, except persistent ones when the source is live.
    /// Returns how many persistent sinks were left closed.
    fn open_all(&mut self, info: &SinkInfo, live_source: bool) -> Result<usize> {
        let mut suppressed = 0;
        for (sink, open) in self.sinks.iter_mut().zip(self.open.iter_mut()) {
            if live_source && sink.persistent() {
                log::info!("live source: persistent sink {} not opened", sink.name());
                suppressed += 1;
                continue;
            }
            sink.open(info)?;
            *open = true;
            log::info!(
                "sink {} opened ({}x{} @ {:.2} fps)",
                sink.name(),
                info.width,
                info.height,
                info.fps
            );
        }
        Ok(suppressed)
    }

    fn any_open(&self) -> bool {
        self.open.iter().any(|&open| open)
    }

    /// Returns how many writes were dropped under `SinkFailurePolicy::Skip`.
    fn write_all(&mut self, frame: &Frame, policy: SinkFailurePolicy) -> Result<u64> {
        let mut skipped = 0;
        for (sink, &open) in self.sinks.iter_mut().zip(self.open.iter()) {
            if !open {
                continue;
            }
            let Err(err) = sink.write(frame) else {
                continue;
            };
            match policy {
                SinkFailurePolicy::Fail => return Err(err),
                SinkFailurePolicy::RetryOnce => {
                    log::warn!("sink {} write failed, retrying: {:#}", sink.name(), err);
                    sink.write(frame)?;
                }
                SinkFailurePolicy::Skip => {
                    log::warn!(
                        "sink {} dropped frame {}: {:#}",
                        sink.name(),
                        frame.sequence,
                        err
                    );
                    skipped += 1;
                }
            }
        }
        Ok(skipped)
    }

    fn close_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for (sink, open) in self.sinks.iter_mut().zip(self.open.iter_mut()) {
            if !std::mem::take(open) {
                continue;
            }
            if let Err(err) = sink.close() {
                log::error!("sink {} failed to close: {:#}", sink.name(), err);
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for SinkSet<'_, '_> {
    fn drop(&mut self) {
        if self.any_open() {
            let _ = self.close_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, StubBackend};
    use crate::distance::KnownWidthTable;
    use crate::ingest::ScriptedSource;
    use crate::sink::MemorySink;

    fn pipeline(detections: Vec<Detection>) -> Pipeline {
        let model = DistanceModel::new(KnownWidthTable::default(), FocalCalibrator::new());
        let settings = PipelineSettings {
            processing_width: 64,
            processing_height: 48,
            ..PipelineSettings::default()
        };
        Pipeline::new(
            Box::new(StubBackend::with_detections(detections)),
            model,
            FrameAnnotator::new().unwrap(),
            settings,
        )
        .unwrap()
    }

    #[test]
    fn process_frame_filters_and_estimates() {
        let mut p = pipeline(vec![
            Detection::new("bicycle", 0.9, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            Detection::new("person", 0.49, BoundingBox::new(0.0, 0.0, 20.0, 20.0)),
            Detection::new("car", 0.8, BoundingBox::new(5.0, 5.0, 5.0, 9.0)),
        ]);
        let frame = Frame::filled(1, 64, 48, [0, 0, 0]);
        let outcome = p.process_frame(&frame).unwrap();

        assert_eq!(outcome.estimates.len(), 1);
        assert_eq!(outcome.estimates[0].0.label, "bicycle");
        assert!((outcome.estimates[0].1 - 3000.0).abs() < 1e-9);
        assert_eq!(outcome.below_threshold, 1);
        assert_eq!(outcome.invalid_geometry, 1);
        assert!(frame.pixels().iter().all(|&b| b == 0));
    }

    #[test]
    fn frames_are_resized_to_processing_resolution() {
        let mut p = pipeline(Vec::new());
        let outcome = p.process_frame(&Frame::filled(4, 320, 240, [1, 2, 3])).unwrap();
        assert_eq!((outcome.frame.width(), outcome.frame.height()), (64, 48));
        assert_eq!(outcome.frame.sequence, 4);
    }

    #[test]
    fn run_freezes_calibration_only_while_running() {
        let mut p = pipeline(Vec::new());
        let calibrator = p.calibrator().clone();
        let mut source = ScriptedSource::with_frames("clip", 64, 48, 1);
        let mut sink = MemorySink::new();
        let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
        p.run(&mut source, &mut sinks).unwrap();
        assert!(!calibrator.is_frozen());
        assert!(calibrator.calibrate(100.0, 10.0, 50.0).is_ok());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let model = DistanceModel::new(KnownWidthTable::default(), FocalCalibrator::new());
        let settings = PipelineSettings {
            confidence_threshold: 1.5,
            ..PipelineSettings::default()
        };
        assert!(Pipeline::new(
            Box::new(StubBackend::new()),
            model,
            FrameAnnotator::new().unwrap(),
            settings
        )
        .is_err());
    }

    #[test]
    fn stop_signal_is_shared() {
        let stop = StopSignal::new();
        let p = pipeline(Vec::new()).with_stop_signal(stop.clone());
        stop.trigger();
        assert!(p.stop_signal().is_set());
        stop.reset();
        assert!(!p.stop_signal().is_set());
    }
}
