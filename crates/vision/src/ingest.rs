//! Upload path: gate, decode, detect, annotate, publish, notify.
//!
//! Frames that arrive while another frame is inside the detector are dropped
//! immediately. The admission permit is shared with the blocking detector
//! task, so a detector call that outlives its timeout still keeps the gate
//! closed until it actually returns.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use actix_web::web;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use chrono::{Local, Utc};
use ml_core::{Detector, RawDetection};
use serde::Serialize;
use tracing::{Instrument, debug, info, warn};

use crate::{
    archive::ImageArchive,
    data::{DetectionRecord, DetectionSummary, FrameEvent, FramePacket, PushEvent},
    error::IngestError,
    gate::{AdmissionPermit, IngestionGate},
    notify::NotificationSink,
    processing::{self, DetectionParams},
    store::FrameStore,
};

/// Runtime knobs for the upload path.
#[derive(Clone, Copy, Debug)]
pub struct IngestSettings {
    pub params: DetectionParams,
    /// Emit `new_frame` for every Nth published frame.
    pub push_every: u64,
    pub detector_timeout: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            params: DetectionParams::default(),
            push_every: 2,
            detector_timeout: Duration::from_secs(5),
        }
    }
}

/// Detection fields reported for an admitted frame.
#[derive(Clone, Debug, Serialize)]
pub struct FrameResult {
    pub detected: bool,
    pub count: usize,
    pub object: String,
    pub detections: Vec<DetectionRecord>,
}

/// Response body for an upload.
///
/// Skipped frames carry only `success` and `skipped`; readers wanting the
/// stored result query `/detection/latest`.
#[derive(Clone, Debug, Serialize)]
pub struct IngestOutcome {
    pub success: bool,
    #[serde(flatten)]
    pub result: Option<FrameResult>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl IngestOutcome {
    fn processed(summary: &DetectionSummary, frame_number: u64, file: Option<String>) -> Self {
        Self {
            success: true,
            result: Some(FrameResult {
                detected: summary.detected(),
                count: summary.count(),
                object: summary.object().to_string(),
                detections: summary.detections().to_vec(),
            }),
            skipped: false,
            frame_number: Some(frame_number),
            file,
        }
    }

    fn skipped() -> Self {
        Self {
            success: true,
            result: None,
            skipped: true,
            frame_number: None,
            file: None,
        }
    }
}

pub struct FrameIngestor {
    gate: IngestionGate,
    published: AtomicU64,
    detector: Arc<dyn Detector>,
    store: Arc<FrameStore>,
    sink: Arc<NotificationSink>,
    archive: Option<Arc<ImageArchive>>,
    settings: IngestSettings,
}

impl FrameIngestor {
    pub fn new(
        detector: Arc<dyn Detector>,
        store: Arc<FrameStore>,
        sink: Arc<NotificationSink>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            gate: IngestionGate::new(),
            published: AtomicU64::new(0),
            detector,
            store,
            sink,
            archive: None,
            settings: IngestSettings {
                push_every: settings.push_every.max(1),
                ..settings
            },
        }
    }

    pub fn with_archive(mut self, archive: Arc<ImageArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn gate(&self) -> &IngestionGate {
        &self.gate
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn model_loaded(&self) -> bool {
        self.detector.model_loaded()
    }

    pub fn archive(&self) -> Option<&ImageArchive> {
        self.archive.as_deref()
    }

    /// Run one uploaded image through the pipeline.
    pub async fn ingest(&self, payload: Bytes) -> Result<IngestOutcome, IngestError> {
        if payload.is_empty() {
            return Err(IngestError::EmptyPayload);
        }
        metrics::counter!("vision_frames_received_total").increment(1);

        let Some(permit) = self.gate.admit() else {
            metrics::counter!("vision_frames_skipped_total").increment(1);
            debug!("detector busy; dropping frame");
            return Ok(IngestOutcome::skipped());
        };
        metrics::counter!("vision_frames_admitted_total").increment(1);

        let sequence = permit.sequence();
        let permit = Arc::new(permit);
        let span = tracing::info_span!("ingest.frame", sequence, bytes = payload.len());
        async move {
            let params = self.settings.params;

            let started = Instant::now();
            let prepared =
                web::block(move || processing::prepare(&payload, params.max_detector_width))
                    .await
                    .map_err(|err| IngestError::Internal(err.to_string()))??;
            record_stage("decode", started);

            let raw = self.run_detector(&permit, prepared.detector_input.clone()).await;
            let records = processing::qualify(raw, prepared.scale, params.confidence_threshold);

            let started = Instant::now();
            let original = prepared.original.clone();
            let archive = self.archive.clone();
            let render_records = records.clone();
            let (jpeg, file) = web::block(move || {
                let jpeg = processing::render(&original, &render_records, &params)?;
                let file = archive.and_then(|archive| archive_frame(&archive, &jpeg));
                anyhow::Ok((jpeg, file))
            })
            .await
            .map_err(|err| IngestError::Internal(err.to_string()))?
            .map_err(|err| IngestError::Internal(format!("{err:#}")))?;
            record_stage("render", started);

            let (width, height) = prepared.original.dimensions();
            let timestamp_ms = Utc::now().timestamp_millis();
            let summary = DetectionSummary::new(records, timestamp_ms);
            let jpeg = Bytes::from(jpeg);
            let frame_number = self.published.fetch_add(1, Ordering::Relaxed) + 1;
            self.store.publish(
                FramePacket {
                    jpeg: jpeg.clone(),
                    frame_number,
                    timestamp_ms,
                    width,
                    height,
                },
                summary.clone(),
            );

            let mut line = format!(
                "Detected: {} | Count: {} | Object: {}",
                summary.detected(),
                summary.count(),
                summary.object()
            );
            if let Some(name) = &file {
                line.push_str(" | File: ");
                line.push_str(name);
            }
            self.sink.log(line);

            if (frame_number - 1) % self.settings.push_every == 0 {
                self.sink.publish(PushEvent::NewFrame(FrameEvent {
                    frame_number,
                    timestamp_ms,
                    detected: summary.detected(),
                    count: summary.count(),
                    object: summary.object().to_string(),
                    detections: summary.detections().to_vec(),
                    file: file.clone(),
                    image: STANDARD.encode(&jpeg),
                }));
            }

            info!(
                frame_number,
                detected = summary.detected(),
                count = summary.count(),
                "frame published"
            );
            Ok::<_, IngestError>(IngestOutcome::processed(&summary, frame_number, file))
        }
        .instrument(span)
        .await
    }

    /// Call the detector on the blocking pool. Any failure, including a
    /// timeout, degrades to "nothing detected".
    async fn run_detector(
        &self,
        permit: &Arc<AdmissionPermit>,
        input: Arc<image::RgbImage>,
    ) -> Vec<RawDetection> {
        let detector = self.detector.clone();
        let held = permit.clone();
        let call = web::block(move || {
            let _held = held;
            let started = Instant::now();
            let result = detector.detect(&input);
            record_stage("detect", started);
            result
        });

        let reason = match tokio::time::timeout(self.settings.detector_timeout, call).await {
            Ok(Ok(Ok(raw))) => return raw,
            Ok(Ok(Err(err))) => format!("{err:#}"),
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!(
                "timed out after {} ms",
                self.settings.detector_timeout.as_millis()
            ),
        };
        metrics::counter!("vision_detector_failures_total").increment(1);
        warn!(detector = self.detector.name(), "detection failed: {reason}");
        self.sink.log(format!("Detection failed: {reason}"));
        Vec::new()
    }
}

fn archive_frame(archive: &ImageArchive, jpeg: &[u8]) -> Option<String> {
    match archive.save(jpeg, Local::now()) {
        Ok(name) => Some(name),
        Err(err) => {
            warn!(
                "failed to archive frame in {}: {err}",
                archive.dir().display()
            );
            None
        }
    }
}

fn record_stage(stage: &'static str, started: Instant) {
    metrics::histogram!("vision_stage_latency_seconds", "stage" => stage)
        .record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, mpsc};

    use anyhow::{Result, bail};
    use image::{Rgb, RgbImage};
    use ml_core::NullDetector;
    use tokio::sync::Notify;

    use super::*;
    use crate::annotation;

    fn jpeg(width: u32, height: u32) -> Bytes {
        let image = RgbImage::from_pixel(width, height, Rgb([90, 120, 150]));
        Bytes::from(annotation::encode_jpeg(&image, 90).unwrap())
    }

    fn door(score: f32) -> RawDetection {
        RawDetection {
            bbox: [40.0, 30.0, 120.0, 200.0],
            score,
            class_id: 1,
        }
    }

    struct FixedDetector(Vec<RawDetection>);

    impl Detector for FixedDetector {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
            Ok(self.0.clone())
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
            bail!("model exploded")
        }
    }

    /// Boxes the middle half of whatever image it receives.
    struct ProportionalDetector;

    impl Detector for ProportionalDetector {
        fn name(&self) -> &'static str {
            "proportional"
        }

        fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>> {
            let (w, h) = (image.width() as f32, image.height() as f32);
            Ok(vec![RawDetection {
                bbox: [w * 0.25, h * 0.25, w * 0.75, h * 0.75],
                score: 0.9,
                class_id: 7,
            }])
        }
    }

    /// Blocks inside `detect` until the test releases it.
    struct GatedDetector {
        entered: Arc<Notify>,
        release: Mutex<mpsc::Receiver<()>>,
        result: Vec<RawDetection>,
    }

    impl GatedDetector {
        fn new(result: Vec<RawDetection>) -> (Self, Arc<Notify>, mpsc::Sender<()>) {
            let entered = Arc::new(Notify::new());
            let (tx, rx) = mpsc::channel();
            let detector = Self {
                entered: entered.clone(),
                release: Mutex::new(rx),
                result,
            };
            (detector, entered, tx)
        }
    }

    impl Detector for GatedDetector {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn detect(&self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
            self.entered.notify_one();
            self.release.lock().unwrap().recv()?;
            Ok(self.result.clone())
        }
    }

    fn result(outcome: &IngestOutcome) -> &FrameResult {
        outcome.result.as_ref().expect("frame was skipped")
    }

    fn ingestor(detector: impl Detector + 'static, settings: IngestSettings) -> FrameIngestor {
        FrameIngestor::new(
            Arc::new(detector),
            Arc::new(FrameStore::new()),
            Arc::new(NotificationSink::in_memory(32)),
            settings,
        )
    }

    async fn wait_until_open(gate: &IngestionGate) {
        for _ in 0..200 {
            if !gate.is_busy() {
                return;
            }
            actix_web::rt::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("gate never reopened");
    }

    #[actix_web::test]
    async fn empty_payload_is_rejected_without_touching_state() {
        let ingestor = ingestor(NullDetector, IngestSettings::default());
        let err = ingestor.ingest(Bytes::new()).await.unwrap_err();
        assert!(matches!(err, IngestError::EmptyPayload));
        assert_eq!(ingestor.gate().arrivals(), 0);
        assert!(ingestor.store.latest_frame().is_none());
    }

    #[actix_web::test]
    async fn undecodable_payload_is_rejected_and_gate_reopens() {
        let ingestor = ingestor(NullDetector, IngestSettings::default());
        let err = ingestor
            .ingest(Bytes::from_static(b"definitely not a jpeg"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Decode(_)));
        assert!(ingestor.store.latest_frame().is_none());
        assert!(!ingestor.gate().is_busy());
    }

    #[actix_web::test]
    async fn empty_scene_then_door() {
        let quiet = ingestor(NullDetector, IngestSettings::default());
        let outcome = quiet.ingest(jpeg(320, 240)).await.unwrap();
        assert!(outcome.success);
        assert!(!result(&outcome).detected);
        assert_eq!(result(&outcome).count, 0);
        assert_eq!(result(&outcome).object, "none");
        assert_eq!(outcome.frame_number, Some(1));

        let busy = ingestor(
            FixedDetector(vec![door(0.82), door(0.1)]),
            IngestSettings::default(),
        );
        let outcome = busy.ingest(jpeg(320, 240)).await.unwrap();
        let found = result(&outcome);
        assert!(found.detected);
        assert_eq!(found.count, 1);
        assert_eq!(found.detections[0].class, "do");
        assert_eq!(found.detections[0].confidence, 0.82);

        let (frame, summary) = busy.store.snapshot();
        let frame = frame.unwrap();
        assert_eq!((frame.width, frame.height), (320, 240));
        assert_eq!(summary.detections(), found.detections.as_slice());
    }

    #[actix_web::test]
    async fn frames_arriving_while_busy_are_skipped() {
        let (detector, entered, release) = GatedDetector::new(vec![door(0.82)]);
        let ingestor = Arc::new(ingestor(detector, IngestSettings::default()));

        let first = {
            let ingestor = ingestor.clone();
            actix_web::rt::spawn(async move { ingestor.ingest(jpeg(320, 240)).await })
        };
        entered.notified().await;

        let second = ingestor.ingest(jpeg(320, 240)).await.unwrap();
        assert!(second.success);
        assert!(second.skipped);
        assert!(second.result.is_none());
        assert_eq!(second.frame_number, None);

        release.send(()).unwrap();
        let first = first.await.unwrap().unwrap();
        assert!(result(&first).detected);
        assert!(!first.skipped);

        let gate = ingestor.gate();
        assert_eq!(gate.arrivals(), 2);
        assert_eq!(gate.admitted(), 1);
        assert_eq!(gate.skipped(), 1);
        assert!(!gate.is_busy());
    }

    #[actix_web::test]
    async fn skipped_frames_leave_latest_summary_in_store() {
        let (detector, entered, release) = GatedDetector::new(vec![door(0.9)]);
        let ingestor = Arc::new(ingestor(detector, IngestSettings::default()));

        let first = {
            let ingestor = ingestor.clone();
            actix_web::rt::spawn(async move { ingestor.ingest(jpeg(64, 64)).await })
        };
        release.send(()).unwrap();
        first.await.unwrap().unwrap();
        entered.notified().await;

        let second = {
            let ingestor = ingestor.clone();
            actix_web::rt::spawn(async move { ingestor.ingest(jpeg(64, 64)).await })
        };
        entered.notified().await;
        let skipped = ingestor.ingest(jpeg(64, 64)).await.unwrap();
        assert!(skipped.skipped);
        assert!(skipped.result.is_none());
        let body = serde_json::to_value(&skipped).unwrap();
        assert_eq!(body, serde_json::json!({ "success": true, "skipped": true }));

        let summary = ingestor.store.latest_summary();
        assert!(summary.detected());
        assert_eq!(summary.object(), "do");

        release.send(()).unwrap();
        second.await.unwrap().unwrap();
    }

    #[actix_web::test]
    async fn detector_failure_degrades_to_empty_frame() {
        let ingestor = ingestor(FailingDetector, IngestSettings::default());
        let outcome = ingestor.ingest(jpeg(100, 80)).await.unwrap();
        assert!(outcome.success);
        assert!(!result(&outcome).detected);
        assert!(ingestor.store.latest_frame().is_some());

        let logs = ingestor.sink.recent_logs();
        assert!(logs.iter().any(|e| e.message.contains("model exploded")));
    }

    #[actix_web::test]
    async fn detector_timeout_keeps_gate_closed_until_detector_returns() {
        let (detector, entered, release) = GatedDetector::new(vec![door(0.9)]);
        let settings = IngestSettings {
            detector_timeout: Duration::from_millis(50),
            ..IngestSettings::default()
        };
        let ingestor = ingestor(detector, settings);

        let outcome = ingestor.ingest(jpeg(64, 64)).await.unwrap();
        entered.notified().await;
        assert!(outcome.success);
        assert!(!result(&outcome).detected);
        assert!(ingestor.gate().is_busy());

        let skipped = ingestor.ingest(jpeg(64, 64)).await.unwrap();
        assert!(skipped.skipped);

        release.send(()).unwrap();
        wait_until_open(ingestor.gate()).await;
        release.send(()).unwrap();
        let admitted = ingestor.ingest(jpeg(64, 64)).await;
        assert!(!admitted.unwrap().skipped);
    }

    #[actix_web::test]
    async fn downscaled_detection_maps_back_to_original_pixels() {
        let large = ingestor(ProportionalDetector, IngestSettings::default());
        let outcome = large.ingest(jpeg(1280, 720)).await.unwrap();
        let detections = &result(&outcome).detections;
        assert_eq!(detections[0].bbox, [320.0, 180.0, 960.0, 540.0]);
        assert_eq!(detections[0].class, "st");

        let small = ingestor(ProportionalDetector, IngestSettings::default());
        let outcome = small.ingest(jpeg(640, 360)).await.unwrap();
        assert_eq!(result(&outcome).detections[0].bbox, [160.0, 90.0, 480.0, 270.0]);
    }

    #[actix_web::test]
    async fn new_frame_push_is_throttled() {
        let settings = IngestSettings {
            push_every: 2,
            ..IngestSettings::default()
        };
        let ingestor = ingestor(FixedDetector(vec![door(0.8)]), settings);
        let mut events = ingestor.sink.subscribe();

        for _ in 0..3 {
            ingestor.ingest(jpeg(48, 48)).await.unwrap();
        }

        let mut pushed = Vec::new();
        let mut logs = 0;
        while let Ok(event) = events.try_recv() {
            match event.as_ref() {
                PushEvent::NewFrame(frame) => {
                    assert!(!frame.image.is_empty());
                    pushed.push(frame.frame_number);
                }
                PushEvent::NewLog { log } => {
                    assert!(log.contains("Detected: true | Count: 1 | Object: do"));
                    logs += 1;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(pushed, vec![1, 3]);
        assert_eq!(logs, 3);
    }

    #[actix_web::test]
    async fn archived_frames_are_named_in_log_and_response() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(ImageArchive::open(dir.path()).unwrap());
        let ingestor = ingestor(NullDetector, IngestSettings::default()).with_archive(archive);

        let outcome = ingestor.ingest(jpeg(32, 32)).await.unwrap();
        let file = outcome.file.unwrap();
        assert!(file.starts_with("classified_"));
        assert!(dir.path().join(&file).is_file());

        let logs = ingestor.sink.recent_logs();
        assert!(logs[0].message.ends_with(&format!("| File: {file}")));
    }
}
