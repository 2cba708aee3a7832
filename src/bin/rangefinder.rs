//! rangefinder - annotate a video stream with per-object distance estimates
//!
//! This binary:
//! 1. Loads configuration (file, environment, then command line)
//! 2. Optionally calibrates the focal length from a reference measurement
//! 3. Opens the frame source (file or live device)
//! 4. Runs the detector and distance model on every frame
//! 5. Writes annotated frames or a video to the output directory (non-live sources only)
//!
//! Ctrl-C stops the loop after the current frame; outputs are closed cleanly.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rangefinder::calibration::derive_focal_length;
use rangefinder::config::RangefinderConfig;
use rangefinder::ingest::source_for;
use rangefinder::pipeline::FramePolicy;
use rangefinder::sink::OutputFormat;
use rangefinder::{BackendRegistry, DistanceModel, FrameAnnotator, FrameSink, Pipeline, StubBackend};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (.toml or .json). Overrides RANGEFINDER_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Video file path, device index, `device:<path>`, or `stub://<name>`.
    #[arg(long)]
    source: Option<String>,
    /// Directory for annotated frames.
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// Do not write annotated frames.
    #[arg(long)]
    no_output: bool,
    /// Persistent output: `images` or `video`.
    #[arg(long, value_name = "FORMAT")]
    output_format: Option<OutputFormat>,
    /// Minimum detection confidence in [0, 1].
    #[arg(long)]
    confidence: Option<f32>,
    /// Fail the run on the first undecodable frame instead of skipping it.
    #[arg(long)]
    strict: bool,
    /// Detector backend name (stub, tract).
    #[arg(long)]
    detector: Option<String>,
    /// ONNX model for the tract backend.
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,
    /// TrueType font used for labels.
    #[arg(long, value_name = "PATH")]
    font: Option<PathBuf>,
    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Derive a focal length from an object of known width at a known distance.
    Calibrate {
        /// Distance from the camera to the reference object, in cm.
        #[arg(long)]
        known_distance: f64,
        /// Real width of the reference object, in cm.
        #[arg(long)]
        known_width: f64,
        /// Width of the reference object in the image, in pixels.
        #[arg(long)]
        apparent_width: f64,
    },
}

impl Args {
    fn apply(&self, cfg: &mut RangefinderConfig) {
        if let Some(source) = &self.source {
            cfg.source = source.clone();
        }
        if let Some(dir) = &self.output {
            cfg.output.dir = dir.clone();
        }
        if let Some(format) = self.output_format {
            cfg.output.format = format;
        }
        if self.no_output {
            cfg.output.enabled = false;
        }
        if let Some(confidence) = self.confidence {
            cfg.pipeline.confidence_threshold = confidence;
        }
        if self.strict {
            cfg.pipeline.frame_policy = FramePolicy::Strict;
        }
        if let Some(detector) = &self.detector {
            cfg.detector.backend = detector.clone();
        }
        if let Some(model) = &self.model {
            cfg.detector.model_path = Some(model.clone());
        }
        if let Some(font) = &self.font {
            cfg.font_path = Some(font.clone());
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Some(Command::Calibrate {
        known_distance,
        known_width,
        apparent_width,
    }) = &args.command
    {
        let focal_length = derive_focal_length(*known_distance, *known_width, *apparent_width)?;
        println!("{}", focal_length);
        log::info!(
            "set RANGEFINDER_FOCAL_LENGTH={} or distance.focal_length in the config file",
            focal_length
        );
        return Ok(());
    }

    let mut cfg = RangefinderConfig::load_with(args.config.as_deref())?;
    args.apply(&mut cfg);
    cfg.validate()?;

    let detector = build_registry(&cfg)?.take(&cfg.detector.backend)?;
    let model = DistanceModel::new(cfg.width_table()?, cfg.focal_calibrator()?);
    log::info!(
        "focal length {}, {} known widths, default width {} cm",
        model.calibrator().focal_length(),
        model.table().len(),
        model.table().default_width()
    );
    let annotator = FrameAnnotator::load(cfg.font_path.as_deref())?;

    let mut pipeline = Pipeline::new(detector, model, annotator, cfg.pipeline.clone())?;
    pipeline.stop_signal().install_ctrlc()?;

    let spec = cfg.source_spec()?;
    let mut source = source_for(&spec, &cfg.source_settings(args.max_frames));

    // Left closed by the pipeline when the opened source reports itself live.
    let mut persistent = cfg.output.sink()?;
    let mut sinks: Vec<&mut dyn FrameSink> = Vec::new();
    if let Some(sink) = persistent.as_mut() {
        sinks.push(sink.as_mut());
    }

    log::info!(
        "rangefinder running: source={} detector={} threshold={:.2} processing={}x{}",
        spec,
        pipeline.detector_name(),
        cfg.pipeline.confidence_threshold,
        cfg.pipeline.processing_width,
        cfg.pipeline.processing_height
    );
    let report = pipeline.run(source.as_mut(), &mut sinks)?;
    log::info!(
        "done: state={:?} frames={} last {}",
        report.final_state,
        report.frames_processed,
        rangefinder::annotate::format_rate(report.last_rate)
    );
    Ok(())
}

fn build_registry(cfg: &RangefinderConfig) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    registry.register(StubBackend::new());

    #[cfg(feature = "backend-tract")]
    {
        use anyhow::Context;
        const MODEL_INPUT_SIZE: u32 = 640;
        if let Some(model_path) = &cfg.detector.model_path {
            let backend = rangefinder::detect::TractBackend::new(
                model_path,
                MODEL_INPUT_SIZE,
                MODEL_INPUT_SIZE,
            )
            .with_context(|| format!("loading detector model {}", model_path.display()))?
            .with_iou_threshold(cfg.detector.iou_threshold);
            registry.register(backend);
        }
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        if cfg.detector.model_path.is_some() {
            log::warn!("model path ignored: built without the backend-tract feature");
        }
    }

    log::debug!("detector backends: {}", registry.list().join(", "));
    Ok(registry)
}
