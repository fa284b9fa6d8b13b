//! Configuration parsing for the frame server.
//!
//! This module owns translation of CLI arguments into a `VisionConfig` struct
//! which the server and ingest path use without re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Args;

use crate::{ingest::IngestSettings, processing::DetectionParams};

#[derive(Clone, Debug)]
/// Canonical configuration shared by every component of the server.
pub struct VisionConfig {
    /// Interface the HTTP server binds to.
    pub host: String,
    pub port: u16,
    /// Actix worker threads; `None` uses one per core.
    pub workers: Option<usize>,
    /// TorchScript model path. Without one the null detector is used.
    pub model_path: Option<PathBuf>,
    /// Square input size the model expects.
    pub model_input: u32,
    /// Overlap above which same-class boxes are suppressed.
    pub iou_threshold: f32,
    /// Append-only event log; `None` keeps logs in memory only.
    pub log_file: Option<PathBuf>,
    /// Directory annotated frames are written to.
    pub archive_dir: Option<PathBuf>,
    pub params: DetectionParams,
    /// Emit `new_frame` for every Nth published frame.
    pub push_every: u64,
    /// Delay between MJPEG parts.
    pub stream_interval: Duration,
    pub detector_timeout: Duration,
    /// Comment line cadence on idle push subscriptions.
    pub keep_alive: Duration,
    /// Events a push subscriber may fall behind before losing the oldest.
    pub subscriber_buffer: usize,
    pub max_upload_bytes: usize,
    /// Emit verbose logging (skipped frames, subscriber churn).
    pub verbose: bool,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing request spans.
    pub chrome_trace_path: Option<PathBuf>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5050,
            workers: None,
            model_path: None,
            model_input: 640,
            iou_threshold: 0.45,
            log_file: Some(PathBuf::from("log.txt")),
            archive_dir: None,
            params: DetectionParams::default(),
            push_every: 2,
            stream_interval: Duration::from_millis(50),
            detector_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(15),
            subscriber_buffer: 16,
            max_upload_bytes: 10 * 1024 * 1024,
            verbose: false,
            telemetry: TelemetryOptions::default(),
        }
    }
}

impl VisionConfig {
    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            params: self.params,
            push_every: self.push_every,
            detector_timeout: self.detector_timeout,
        }
    }
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct VisionCliArgs {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "CANE_HOST", default_value = "0.0.0.0")]
    pub host: String,
    /// Port to listen on.
    #[arg(long, env = "CANE_PORT", default_value_t = 5050)]
    pub port: u16,
    /// Number of HTTP worker threads.
    #[arg(long, env = "CANE_WORKERS", value_name = "N")]
    pub workers: Option<usize>,
    /// TorchScript detector model.
    #[arg(long = "model", env = "CANE_MODEL", value_name = "PATH")]
    pub model_path: Option<PathBuf>,
    /// Square model input size in pixels.
    #[arg(long, env = "CANE_MODEL_INPUT", value_name = "PX", default_value_t = 640)]
    pub model_input: u32,
    /// IoU above which overlapping boxes of one class are merged.
    #[arg(long = "iou", env = "CANE_IOU", value_name = "IOU")]
    pub iou_threshold: Option<f32>,
    /// Append-only event log file.
    #[arg(long, env = "CANE_LOG_FILE", value_name = "PATH", default_value = "log.txt")]
    pub log_file: PathBuf,
    /// Keep the event log in memory only.
    #[arg(long, action = clap::ArgAction::SetTrue, conflicts_with = "log_file")]
    pub no_log_file: bool,
    /// Write every annotated frame into this directory.
    #[arg(long, env = "CANE_ARCHIVE_DIR", value_name = "DIR")]
    pub archive_dir: Option<PathBuf>,
    /// JPEG quality used by the encoder (1-100).
    #[arg(long, env = "CANE_JPEG_QUALITY", value_name = "QUALITY")]
    pub jpeg_quality: Option<i32>,
    /// Minimum detector confidence kept in results.
    #[arg(long, env = "CANE_CONFIDENCE", value_name = "SCORE")]
    pub confidence: Option<f32>,
    /// Confidence above which boxes get a caption.
    #[arg(long, env = "CANE_LABEL_CONFIDENCE", value_name = "SCORE")]
    pub label_confidence: Option<f32>,
    /// Frames wider than this are downscaled before detection.
    #[arg(long, env = "CANE_DETECTOR_WIDTH", value_name = "PX")]
    pub detector_width: Option<u32>,
    /// Push `new_frame` for every Nth published frame.
    #[arg(long, env = "CANE_PUSH_EVERY", value_name = "N")]
    pub push_every: Option<u64>,
    /// Delay between MJPEG stream parts.
    #[arg(long, env = "CANE_STREAM_INTERVAL_MS", value_name = "MS")]
    pub stream_interval_ms: Option<u64>,
    /// Detector call budget before the frame degrades to no detection.
    #[arg(long, env = "CANE_DETECTOR_TIMEOUT_MS", value_name = "MS")]
    pub detector_timeout_ms: Option<u64>,
    /// Events buffered per push subscriber.
    #[arg(long, env = "CANE_SUBSCRIBER_BUFFER", value_name = "N")]
    pub subscriber_buffer: Option<usize>,
    /// Largest accepted upload in bytes.
    #[arg(long, env = "CANE_MAX_UPLOAD_BYTES", value_name = "BYTES")]
    pub max_upload_bytes: Option<usize>,
    /// Enable verbose logging.
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

fn threshold(value: Option<f32>, default: f32, flag: &str) -> Result<f32> {
    let value = value.unwrap_or(default);
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        bail!("{flag} must be between 0 and 1");
    }
    Ok(value)
}

impl TryFrom<VisionCliArgs> for VisionConfig {
    type Error = anyhow::Error;

    fn try_from(args: VisionCliArgs) -> Result<Self> {
        let defaults = VisionConfig::default();

        if args.host.trim().is_empty() {
            bail!("--host must not be empty");
        }
        if args.workers == Some(0) {
            bail!("--workers must be at least 1");
        }
        if args.model_input == 0 || args.model_input % 32 != 0 {
            bail!("--model-input must be a positive multiple of 32");
        }

        let jpeg_quality = args.jpeg_quality.unwrap_or(85);
        if !(1..=100).contains(&jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let confidence_threshold = threshold(
            args.confidence,
            defaults.params.confidence_threshold,
            "--confidence",
        )?;
        let label_threshold = threshold(
            args.label_confidence,
            defaults.params.label_threshold,
            "--label-confidence",
        )?;

        let iou_threshold = threshold(args.iou_threshold, defaults.iou_threshold, "--iou")?;

        let max_detector_width = args
            .detector_width
            .unwrap_or(defaults.params.max_detector_width);
        if max_detector_width < 32 {
            bail!("--detector-width must be at least 32 pixels");
        }

        let push_every = args.push_every.unwrap_or(defaults.push_every);
        if push_every == 0 {
            bail!("--push-every must be at least 1");
        }

        let stream_interval_ms = args.stream_interval_ms.unwrap_or(50);
        if stream_interval_ms == 0 {
            bail!("--stream-interval-ms must be at least 1");
        }

        let detector_timeout_ms = args.detector_timeout_ms.unwrap_or(5_000);
        if detector_timeout_ms == 0 {
            bail!("--detector-timeout-ms must be at least 1");
        }

        let subscriber_buffer = args.subscriber_buffer.unwrap_or(defaults.subscriber_buffer);
        if subscriber_buffer == 0 {
            bail!("--subscriber-buffer must be at least 1");
        }

        let max_upload_bytes = args.max_upload_bytes.unwrap_or(defaults.max_upload_bytes);
        if max_upload_bytes == 0 {
            bail!("--max-upload-bytes must be at least 1");
        }

        Ok(Self {
            host: args.host,
            port: args.port,
            workers: args.workers,
            model_path: args.model_path,
            model_input: args.model_input,
            iou_threshold,
            log_file: (!args.no_log_file).then_some(args.log_file),
            archive_dir: args.archive_dir,
            params: DetectionParams {
                confidence_threshold,
                label_threshold,
                max_detector_width,
                jpeg_quality: jpeg_quality as u8,
            },
            push_every,
            stream_interval: Duration::from_millis(stream_interval_ms),
            detector_timeout: Duration::from_millis(detector_timeout_ms),
            keep_alive: defaults.keep_alive,
            subscriber_buffer,
            max_upload_bytes,
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}
