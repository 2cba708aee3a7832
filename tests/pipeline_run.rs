use anyhow::Result;

use rangefinder::pipeline::FALLBACK_OUTPUT_FPS;
use rangefinder::sink::SinkInfo;
use rangefinder::{
    BoundingBox, Detection, DistanceModel, FocalCalibrator, Frame, FrameAnnotator, FramePolicy,
    FrameSink, ImageSequenceSink, KnownWidthTable, MemorySink, Pipeline, PipelineError,
    PipelineSettings, PipelineState, ScriptedSource, SinkFailurePolicy, StopSignal, StubBackend,
};

const W: u32 = 64;
const H: u32 = 48;

fn settings() -> PipelineSettings {
    PipelineSettings {
        processing_width: W,
        processing_height: H,
        ..PipelineSettings::default()
    }
}

fn build(backend: StubBackend, settings: PipelineSettings) -> Pipeline {
    let model = DistanceModel::new(KnownWidthTable::default(), FocalCalibrator::new());
    Pipeline::new(Box::new(backend), model, FrameAnnotator::new().unwrap(), settings).unwrap()
}

fn green_at(frame: &Frame, x: u32, y: u32) -> bool {
    frame.image().get_pixel(x, y).0 == [0, 255, 0]
}

/// Sink that triggers a stop signal after its first frame.
struct StoppingSink {
    inner: MemorySink,
    stop: StopSignal,
}

impl FrameSink for StoppingSink {
    fn name(&self) -> String {
        "stopping".to_string()
    }

    fn open(&mut self, info: &SinkInfo) -> Result<()> {
        self.inner.open(info)
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.inner.write(frame)?;
        self.stop.trigger();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// Sink that tries to recalibrate while the loop is running.
struct CalibratingSink {
    calibrator: FocalCalibrator,
    results: Vec<Option<&'static str>>,
}

impl FrameSink for CalibratingSink {
    fn name(&self) -> String {
        "calibrating".to_string()
    }

    fn open(&mut self, _info: &SinkInfo) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, _frame: &Frame) -> Result<()> {
        let outcome = self.calibrator.calibrate(100.0, 10.0, 50.0);
        self.results.push(outcome.err().map(|e| e.code()));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn three_frames_then_exhaustion_stops_cleanly() {
    let mut pipeline = build(StubBackend::new(), settings());
    assert_eq!(pipeline.state(), PipelineState::Idle);

    let mut source = ScriptedSource::with_frames("clip", W, H, 3);
    let mut sink = MemorySink::new();
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
    let report = pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(report.final_state, PipelineState::Stopped);
    assert_eq!(report.frames_read, 3);
    assert_eq!(report.frames_processed, 3);
    let sequences: Vec<u64> = sink.frames().iter().map(|f| f.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert_eq!(sink.close_count(), 1);
    assert!(!sink.is_open());
    assert!(!source.is_open());
    assert_eq!(source.close_count(), 1);
}

#[test]
fn source_open_failure_fails_without_reading() {
    let mut pipeline = build(StubBackend::new(), settings());
    let mut source = ScriptedSource::unavailable("cam", "no such device");
    let mut sink = MemorySink::new();
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];

    let err = pipeline.run(&mut source, &mut sinks).unwrap_err();
    assert_eq!(
        PipelineError::find(&err).map(|e| e.code()),
        Some("SOURCE_UNAVAILABLE")
    );
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(pipeline.report().frames_read, 0);
    assert_eq!(source.frames_read(), 0);
    assert!(sink.frames().is_empty());
    assert!(sink.info().is_none());
    assert!(!source.is_open());
}

#[test]
fn sinks_are_declared_at_processing_resolution() {
    let mut pipeline = build(StubBackend::new(), settings());
    let mut source = ScriptedSource::new("clip", 320, 240, 0.0);
    source.push_frame(Frame::filled(1, 320, 240, [5, 5, 5]));
    let mut sink = MemorySink::new();
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
    pipeline.run(&mut source, &mut sinks).unwrap();

    let info = sink.info().unwrap();
    assert_eq!((info.width, info.height), (W, H));
    assert_eq!(info.fps, FALLBACK_OUTPUT_FPS);
    assert_eq!(sink.frames()[0].width(), W);
}

#[test]
fn low_confidence_detections_never_reach_the_output() {
    let (w, h) = (320, 240);
    let kept = Detection::new("person", 0.5, BoundingBox::new(4.0, 100.0, 60.0, 200.0));
    let dropped = Detection::new("car", 0.49, BoundingBox::new(200.0, 120.0, 300.0, 220.0));
    let mut pipeline = build(
        StubBackend::with_detections(vec![kept, dropped]),
        PipelineSettings {
            processing_width: w,
            processing_height: h,
            ..PipelineSettings::default()
        },
    );

    let mut source = ScriptedSource::with_frames("clip", w, h, 1);
    let mut sink = MemorySink::new();
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
    let report = pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(report.detections_below_threshold, 1);
    let frame = &sink.frames()[0];
    assert!(green_at(frame, 4, 100));
    let label_tinted = (0..100).any(|y| {
        (0..w).any(|x| {
            let [r, g, b] = frame.image().get_pixel(x, y).0;
            g > r && g > b
        })
    });
    assert!(label_tinted);
    assert!(!green_at(frame, 200, 120));
    assert!(!green_at(frame, 299, 219));
}

#[test]
fn degenerate_boxes_are_skipped_and_counted() {
    let zero_width = Detection::new("person", 0.9, BoundingBox::new(10.0, 10.0, 10.0, 30.0));
    let mut pipeline = build(StubBackend::with_detections(vec![zero_width]), settings());
    let mut source = ScriptedSource::with_frames("clip", W, H, 2);
    let mut sink = MemorySink::new();
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
    let report = pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(report.final_state, PipelineState::Stopped);
    assert_eq!(report.detections_invalid_geometry, 2);
    assert_eq!(sink.frames().len(), 2);
}

#[test]
fn stop_signal_drains_after_current_frame() {
    let stop = StopSignal::new();
    let mut pipeline = build(StubBackend::new(), settings()).with_stop_signal(stop.clone());
    let mut source = ScriptedSource::with_frames("clip", W, H, 5);
    let mut sink = StoppingSink {
        inner: MemorySink::new(),
        stop,
    };
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
    let report = pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(report.final_state, PipelineState::Stopped);
    assert_eq!(report.frames_read, 1);
    assert_eq!(sink.inner.frames().len(), 1);
    assert_eq!(sink.inner.close_count(), 1);
    assert_eq!(source.remaining(), 4);
    assert!(!source.is_open());
}

#[test]
fn corrupt_frames_are_skipped_by_default() {
    let mut pipeline = build(StubBackend::new(), settings());
    let mut source = ScriptedSource::new("clip", W, H, 30.0);
    source.push_frame(Frame::filled(1, W, H, [0, 0, 0]));
    source.push_corrupt("truncated packet");
    source.push_frame(Frame::filled(3, W, H, [0, 0, 0]));
    let mut sink = MemorySink::new();
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
    let report = pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(report.final_state, PipelineState::Stopped);
    assert_eq!(report.frames_skipped, 1);
    let sequences: Vec<u64> = sink.frames().iter().map(|f| f.sequence).collect();
    assert_eq!(sequences, vec![1, 3]);
}

#[test]
fn strict_mode_fails_on_corrupt_frame_and_releases_everything() {
    let mut pipeline = build(
        StubBackend::new(),
        PipelineSettings {
            frame_policy: FramePolicy::Strict,
            ..settings()
        },
    );
    let mut source = ScriptedSource::new("clip", W, H, 30.0);
    source.push_frame(Frame::filled(1, W, H, [0, 0, 0]));
    source.push_corrupt("truncated packet");
    source.push_frame(Frame::filled(3, W, H, [0, 0, 0]));
    let mut sink = MemorySink::new();
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];

    let err = pipeline.run(&mut source, &mut sinks).unwrap_err();
    assert_eq!(
        PipelineError::find(&err).map(|e| e.code()),
        Some("FRAME_DECODE_FAILURE")
    );
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(sink.frames().len(), 1);
    assert_eq!(sink.close_count(), 1);
    assert!(!source.is_open());
}

#[test]
fn persistent_decode_failures_count_as_exhaustion() {
    let mut pipeline = build(
        StubBackend::new(),
        PipelineSettings {
            max_consecutive_frame_failures: 2,
            ..settings()
        },
    );
    let mut source = ScriptedSource::new("clip", W, H, 30.0);
    for _ in 0..5 {
        source.push_corrupt("no signal");
    }
    source.push_frame(Frame::filled(6, W, H, [0, 0, 0]));
    let mut sink = MemorySink::new();
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
    let report = pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(report.final_state, PipelineState::Stopped);
    assert_eq!(report.frames_skipped, 3);
    assert!(sink.frames().is_empty());
}

#[test]
fn sink_write_is_retried_once() {
    let mut pipeline = build(StubBackend::new(), settings());
    let mut source = ScriptedSource::with_frames("clip", W, H, 2);
    let mut sink = MemorySink::failing(1);
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
    let report = pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(report.final_state, PipelineState::Stopped);
    assert_eq!(sink.frames().len(), 2);
    assert_eq!(sink.write_attempts(), 3);
}

#[test]
fn sink_failing_twice_is_fatal() {
    let mut pipeline = build(StubBackend::new(), settings());
    let mut source = ScriptedSource::with_frames("clip", W, H, 2);
    let mut sink = MemorySink::failing(2);
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];

    let err = pipeline.run(&mut source, &mut sinks).unwrap_err();
    assert_eq!(
        PipelineError::find(&err).map(|e| e.code()),
        Some("SINK_WRITE_FAILURE")
    );
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(sink.close_count(), 1);
    assert!(!source.is_open());
}

#[test]
fn skip_policy_drops_failed_writes() {
    let mut pipeline = build(
        StubBackend::new(),
        PipelineSettings {
            sink_policy: SinkFailurePolicy::Skip,
            ..settings()
        },
    );
    let mut source = ScriptedSource::with_frames("clip", W, H, 3);
    let mut sink = MemorySink::failing(1);
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
    let report = pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(report.sink_writes_skipped, 1);
    let sequences: Vec<u64> = sink.frames().iter().map(|f| f.sequence).collect();
    assert_eq!(sequences, vec![2, 3]);
}

#[test]
fn calibration_is_rejected_while_running() {
    let mut pipeline = build(StubBackend::new(), settings());
    let calibrator = pipeline.calibrator().clone();
    let before = calibrator.focal_length();

    let mut source = ScriptedSource::with_frames("clip", W, H, 1);
    let mut sink = CalibratingSink {
        calibrator: calibrator.clone(),
        results: Vec::new(),
    };
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut sink];
    pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(sink.results, vec![Some("CALIBRATION_LOCKED")]);
    assert_eq!(calibrator.focal_length(), before);
    assert!(calibrator.calibrate(100.0, 10.0, 50.0).is_ok());
}

#[test]
fn runs_with_no_sinks() {
    let mut pipeline = build(StubBackend::new(), settings());
    let mut source = ScriptedSource::with_frames("clip", W, H, 2);
    let report = pipeline.run(&mut source, &mut []).unwrap();
    assert_eq!(report.frames_processed, 2);
}

#[test]
fn live_sources_leave_persistent_sinks_closed() {
    let mut pipeline = build(StubBackend::new(), settings());
    let mut source = ScriptedSource::with_frames("camera", W, H, 2).live();
    let mut display = MemorySink::new();
    let mut recorder = MemorySink::new().marked_persistent();
    let mut sinks: [&mut dyn FrameSink; 2] = [&mut display, &mut recorder];
    let report = pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(report.persistent_sinks_suppressed, 1);
    assert_eq!(display.frames().len(), 2);
    assert_eq!(display.close_count(), 1);
    assert!(recorder.info().is_none());
    assert_eq!(recorder.write_attempts(), 0);
    assert_eq!(recorder.close_count(), 0);
}

#[test]
fn file_sources_open_persistent_sinks() {
    let mut pipeline = build(StubBackend::new(), settings());
    let mut source = ScriptedSource::with_frames("clip", W, H, 2);
    let mut recorder = MemorySink::new().marked_persistent();
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut recorder];
    let report = pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(report.persistent_sinks_suppressed, 0);
    assert_eq!(recorder.frames().len(), 2);
    assert_eq!(recorder.close_count(), 1);
}

#[test]
fn live_source_writes_no_image_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("annotated");
    let mut pipeline = build(StubBackend::new(), settings());
    let mut source = ScriptedSource::with_frames("camera", W, H, 1).live();
    let mut images = ImageSequenceSink::new(&out);
    let mut sinks: [&mut dyn FrameSink; 1] = [&mut images];
    pipeline.run(&mut source, &mut sinks).unwrap();

    assert_eq!(images.frames_written(), 0);
    assert!(!out.exists());
}
