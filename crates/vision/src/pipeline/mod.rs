//! Server bootstrap: telemetry, detector loading, shared state, HTTP listener.

pub mod config;
pub mod telemetry;

use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use anyhow::{Context, Result};
use bytes::Bytes;
use ml_core::{Detector, NullDetector};
use tracing::{info, warn};

use crate::{
    annotation,
    archive::ImageArchive,
    ingest::FrameIngestor,
    location::LocationBook,
    notify::NotificationSink,
    server::{self, AppState, PLACEHOLDER_CAPTION},
    store::FrameStore,
};

pub use config::{TelemetryOptions, VisionCliArgs, VisionConfig};

const PLACEHOLDER_SIZE: (u32, u32) = (640, 480);

/// Install telemetry, load the detector and serve until the server stops.
pub fn run(config: VisionConfig) -> Result<()> {
    let _telemetry = telemetry::init_tracing(&config.telemetry, config.verbose)?;
    telemetry::init_metrics_recorder()?;

    let detector = load_detector(&config)?;
    actix_web::rt::System::new().block_on(serve(config, detector))
}

/// Bind and run the HTTP server with an already constructed detector.
pub async fn serve(config: VisionConfig, detector: Arc<dyn Detector>) -> Result<()> {
    let state = web::Data::new(build_state(&config, detector)?);
    info!(
        host = %config.host,
        port = config.port,
        detector = state.ingestor.detector_name(),
        push_every = config.push_every,
        "starting frame server"
    );
    state.sink.log(format!(
        "Server started on {}:{} with {} detector",
        config.host,
        config.port,
        state.ingestor.detector_name()
    ));

    let app_state = state.clone();
    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(server::configure)
    });
    if let Some(workers) = config.workers {
        server = server.workers(workers);
    }
    server
        .bind((config.host.as_str(), config.port))
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?
        .run()
        .await
        .context("HTTP server error")
}

/// Wire the store, sink, archive and ingestor together.
pub fn build_state(config: &VisionConfig, detector: Arc<dyn Detector>) -> Result<AppState> {
    let store = Arc::new(FrameStore::new());
    let sink = Arc::new(NotificationSink::new(
        config.log_file.as_deref(),
        config.subscriber_buffer,
    )?);

    let mut ingestor = FrameIngestor::new(
        detector,
        store.clone(),
        sink.clone(),
        config.ingest_settings(),
    );
    if let Some(dir) = &config.archive_dir {
        ingestor = ingestor.with_archive(Arc::new(ImageArchive::open(dir)?));
    }

    let (width, height) = PLACEHOLDER_SIZE;
    let placeholder = annotation::encode_jpeg(
        &annotation::placeholder(width, height, PLACEHOLDER_CAPTION),
        config.params.jpeg_quality,
    )
    .context("failed to encode placeholder frame")?;

    Ok(AppState {
        store,
        ingestor: Arc::new(ingestor),
        sink,
        locations: Arc::new(LocationBook::new()),
        placeholder: Bytes::from(placeholder),
        stream_interval: config.stream_interval,
        keep_alive: config.keep_alive,
        max_upload_bytes: config.max_upload_bytes,
    })
}

#[cfg(feature = "with-tch")]
pub fn load_detector(config: &VisionConfig) -> Result<Arc<dyn Detector>> {
    use ml_core::torchscript::TorchScriptDetector;

    match &config.model_path {
        Some(path) => {
            let detector = TorchScriptDetector::new(path, i64::from(config.model_input))
                .with_context(|| format!("failed to load detector model {}", path.display()))?
                .with_iou_threshold(config.iou_threshold);
            info!(model = %path.display(), device = ?detector.device(), "detector loaded");
            Ok(Arc::new(detector))
        }
        None => {
            warn!("no --model given; running with the null detector");
            Ok(Arc::new(NullDetector))
        }
    }
}

#[cfg(not(feature = "with-tch"))]
pub fn load_detector(config: &VisionConfig) -> Result<Arc<dyn Detector>> {
    if let Some(path) = &config.model_path {
        anyhow::bail!(
            "cannot load {}: built without the `with-tch` feature",
            path.display()
        );
    }
    warn!("no --model given; running with the null detector");
    Ok(Arc::new(NullDetector))
}
