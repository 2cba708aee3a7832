use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calibration::{FocalCalibrator, FocalLength, DEFAULT_FOCAL_LENGTH};
use crate::distance::{KnownWidthTable, DEFAULT_WIDTH_CM};
use crate::ingest::{SourceSettings, SourceSpec};
use crate::pipeline::{
    FramePolicy, PipelineSettings, SinkFailurePolicy, DEFAULT_CONFIDENCE_THRESHOLD,
    DEFAULT_MAX_CONSECUTIVE_FRAME_FAILURES, DEFAULT_PROCESSING_HEIGHT, DEFAULT_PROCESSING_WIDTH,
};
use crate::sink::{persistent_sink, FrameSink, OutputFormat};

const DEFAULT_SOURCE: &str = "stub://scene";
const DEFAULT_OUTPUT_DIR: &str = "output_frames";
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RangefinderConfigFile {
    source: Option<String>,
    detection: Option<DetectionConfigFile>,
    processing: Option<ProcessingConfigFile>,
    distance: Option<DistanceConfigFile>,
    output: Option<OutputConfigFile>,
    annotate: Option<AnnotateConfigFile>,
    calibration: Option<CalibrationSettings>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    confidence_threshold: Option<f32>,
    backend: Option<String>,
    model_path: Option<PathBuf>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ProcessingConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    strict: Option<bool>,
    sink_failure_policy: Option<SinkFailurePolicy>,
    max_consecutive_frame_failures: Option<u32>,
    frame_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DistanceConfigFile {
    focal_length: Option<f64>,
    default_width_cm: Option<f64>,
    known_widths: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    dir: Option<PathBuf>,
    enabled: Option<bool>,
    format: Option<OutputFormat>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AnnotateConfigFile {
    font_path: Option<PathBuf>,
}

/// Reference measurement for a one-shot calibration before the loop starts.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationSettings {
    pub known_distance_cm: f64,
    pub known_width_cm: f64,
    pub apparent_width_px: f64,
}

#[derive(Debug, Clone)]
pub struct RangefinderConfig {
    /// File path or live device marker, see `SourceSpec::parse`.
    pub source: String,
    pub detector: DetectorSettings,
    pub pipeline: PipelineSettings,
    pub distance: DistanceSettings,
    pub output: OutputSettings,
    pub font_path: Option<PathBuf>,
    pub frame_timeout: Duration,
    pub calibration: Option<CalibrationSettings>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub iou_threshold: f32,
}

#[derive(Debug, Clone)]
pub struct DistanceSettings {
    pub focal_length: f64,
    pub default_width_cm: f64,
    pub known_widths: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub dir: PathBuf,
    pub enabled: bool,
    pub format: OutputFormat,
}

impl OutputSettings {
    /// The persistent writer, or `None` when output is disabled.
    ///
    /// The pipeline still leaves it closed when the source turns out to be live.
    pub fn sink(&self) -> Result<Option<Box<dyn FrameSink>>> {
        if !self.enabled {
            return Ok(None);
        }
        persistent_sink(self.format, &self.dir).map(Some)
    }
}

impl Default for RangefinderConfig {
    fn default() -> Self {
        Self::from_file(RangefinderConfigFile::default())
    }
}

impl RangefinderConfig {
    /// Load from `RANGEFINDER_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Like `load`, but an explicit `config_path` wins over `RANGEFINDER_CONFIG`.
    pub fn load_with(config_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("RANGEFINDER_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match config_path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => RangefinderConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RangefinderConfigFile) -> Self {
        let detection = file.detection.unwrap_or_default();
        let processing = file.processing.unwrap_or_default();
        let distance = file.distance.unwrap_or_default();
        let output = file.output.unwrap_or_default();
        let annotate = file.annotate.unwrap_or_default();

        let pipeline = PipelineSettings {
            confidence_threshold: detection
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            processing_width: processing.width.unwrap_or(DEFAULT_PROCESSING_WIDTH),
            processing_height: processing.height.unwrap_or(DEFAULT_PROCESSING_HEIGHT),
            frame_policy: if processing.strict.unwrap_or(false) {
                FramePolicy::Strict
            } else {
                FramePolicy::Skip
            },
            sink_policy: processing.sink_failure_policy.unwrap_or_default(),
            max_consecutive_frame_failures: processing
                .max_consecutive_frame_failures
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FRAME_FAILURES),
        };

        Self {
            source: file.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            detector: DetectorSettings {
                backend: detection
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detection.model_path,
                iou_threshold: detection.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            },
            pipeline,
            distance: DistanceSettings {
                focal_length: distance.focal_length.unwrap_or(DEFAULT_FOCAL_LENGTH),
                default_width_cm: distance.default_width_cm.unwrap_or(DEFAULT_WIDTH_CM),
                known_widths: distance.known_widths.unwrap_or_else(|| {
                    KnownWidthTable::default()
                        .iter()
                        .map(|(category, width)| (category.to_string(), width))
                        .collect()
                }),
            },
            output: OutputSettings {
                dir: output
                    .dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
                enabled: output.enabled.unwrap_or(true),
                format: output.format.unwrap_or_default(),
            },
            font_path: annotate.font_path,
            frame_timeout: Duration::from_millis(
                processing.frame_timeout_ms.unwrap_or(DEFAULT_FRAME_TIMEOUT_MS),
            ),
            calibration: file.calibration,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(source) = env_value("RANGEFINDER_SOURCE") {
            self.source = source;
        }
        if let Some(raw) = env_value("RANGEFINDER_CONFIDENCE") {
            self.pipeline.confidence_threshold = raw
                .parse()
                .map_err(|_| anyhow!("RANGEFINDER_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Some(raw) = env_value("RANGEFINDER_FOCAL_LENGTH") {
            self.distance.focal_length = raw
                .parse()
                .map_err(|_| anyhow!("RANGEFINDER_FOCAL_LENGTH must be a positive number"))?;
        }
        if let Some(dir) = env_value("RANGEFINDER_OUTPUT_DIR") {
            self.output.dir = PathBuf::from(dir);
        }
        if let Some(raw) = env_value("RANGEFINDER_OUTPUT_FORMAT") {
            self.output.format = raw.parse()?;
        }
        if let Some(backend) = env_value("RANGEFINDER_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(model) = env_value("RANGEFINDER_MODEL") {
            self.detector.model_path = Some(PathBuf::from(model));
        }
        if let Some(raw) = env_value("RANGEFINDER_STRICT") {
            self.pipeline.frame_policy = if parse_bool(&raw)
                .ok_or_else(|| anyhow!("RANGEFINDER_STRICT must be true or false"))?
            {
                FramePolicy::Strict
            } else {
                FramePolicy::Skip
            };
        }
        Ok(())
    }

    /// Check every value that is not enforced by its type.
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        FocalLength::new(self.distance.focal_length)?;
        self.width_table()?;
        let iou = self.detector.iou_threshold;
        if !(iou > 0.0 && iou <= 1.0) {
            return Err(anyhow!("IoU threshold must be within (0, 1], got {}", iou));
        }
        if self.detector.backend.trim().is_empty() {
            return Err(anyhow!("detector backend must not be empty"));
        }
        SourceSpec::parse(&self.source)?;
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        {
            if self.output.enabled && self.output.format == OutputFormat::Video {
                return Err(anyhow!("video output requires the ingest-file-ffmpeg feature"));
            }
        }
        Ok(())
    }

    pub fn source_spec(&self) -> Result<SourceSpec> {
        SourceSpec::parse(&self.source)
    }

    pub fn source_settings(&self, max_frames: Option<u64>) -> SourceSettings {
        SourceSettings {
            frame_timeout: self.frame_timeout,
            max_frames,
            ..SourceSettings::default()
        }
    }

    pub fn width_table(&self) -> Result<KnownWidthTable> {
        let table = KnownWidthTable::new(
            self.distance
                .known_widths
                .iter()
                .map(|(category, width)| (category.clone(), *width)),
            self.distance.default_width_cm,
        )?;
        Ok(table)
    }

    /// Calibrator seeded with the configured focal length, then calibrated
    /// from the `calibration` block if one is present.
    pub fn focal_calibrator(&self) -> Result<FocalCalibrator> {
        let calibrator =
            FocalCalibrator::with_focal_length(FocalLength::new(self.distance.focal_length)?);
        if let Some(cal) = &self.calibration {
            calibrator
                .calibrate(cal.known_distance_cm, cal.known_width_cm, cal.apparent_width_px)
                .context("calibration block")?;
        }
        Ok(calibrator)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_config_file(path: &Path) -> Result<RangefinderConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
