//! Actix Web surface: frame upload, MJPEG stream, detection query, push events.
//!
//! Handlers only touch shared state through [`AppState`]; nothing here runs
//! the detector directly.

use std::{sync::Arc, time::Duration};

use actix_multipart::Multipart;
use actix_web::{
    HttpRequest, HttpResponse, HttpResponseBuilder,
    error::JsonPayloadError,
    http::header,
    web::{self, Bytes, BytesMut},
};
use async_stream::stream;
use futures_util::{StreamExt as _, TryStreamExt as _};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{
    archive::RECENT_FILE_LIMIT,
    data::{DetectionSummary, Location, PushEvent},
    error::{ApiError, IngestError},
    ingest::FrameIngestor,
    location::LocationBook,
    notify::{EventReceiver, NotificationSink},
    pipeline::telemetry,
    store::FrameStore,
};

/// Caption drawn on the stream until the first frame is published.
pub const PLACEHOLDER_CAPTION: &str = "WAITING FOR FRAME";

/// Shared state backing HTTP handlers.
pub struct AppState {
    pub store: Arc<FrameStore>,
    pub ingestor: Arc<FrameIngestor>,
    pub sink: Arc<NotificationSink>,
    pub locations: Arc<LocationBook>,
    /// Pre-encoded JPEG served before any frame exists.
    pub placeholder: Bytes,
    pub stream_interval: Duration,
    pub keep_alive: Duration,
    pub max_upload_bytes: usize,
}

/// Register every route on an app or scope.
pub fn configure(cfg: &mut web::ServiceConfig) {
    for path in ["/frame", "/upload", "/upload_image"] {
        cfg.route(path, web::post().to(upload_handler));
    }
    for path in ["/stream", "/stream.mjpg"] {
        cfg.route(path, web::get().to(stream_handler));
    }
    cfg.route("/detection/latest-image", web::get().to(latest_image_handler))
        .service(
            web::resource("/detection/latest")
                .app_data(json_config())
                .route(web::get().to(get_detection_handler))
                .route(web::post().to(replace_detection_handler)),
        )
        .route("/get_detection", web::get().to(get_detection_handler))
        .route("/events", web::get().to(events_handler));
    for path in ["/location", "/send_location"] {
        cfg.service(
            web::resource(path)
                .app_data(json_config())
                .route(web::post().to(location_handler)),
        );
    }
    cfg.route("/classified/{filename}", web::get().to(classified_handler))
        .route("/health", web::get().to(health_handler))
        .route("/logs", web::get().to(logs_handler))
        .route("/metrics", web::get().to(metrics_handler));
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(256 * 1024)
        .error_handler(|err: JsonPayloadError, _req: &HttpRequest| {
            ApiError::BadRequest(err.to_string()).into()
        })
}

/// CORS and no-cache headers shared by the long-lived responses.
fn live_response() -> HttpResponseBuilder {
    let mut builder = HttpResponse::Ok();
    builder
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, "*"))
        .insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET"))
        .insert_header((header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"))
        .insert_header((header::CACHE_CONTROL, "no-cache"));
    builder
}

/// Accept a frame as a raw body or as a multipart upload.
async fn upload_handler(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, IngestError> {
    let limit = state.max_upload_bytes;
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/"));

    let bytes = if is_multipart {
        read_multipart_image(Multipart::new(req.headers(), payload), limit).await?
    } else {
        read_body(payload, limit).await?
    };

    let outcome = state.ingestor.ingest(bytes).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

async fn read_body(mut payload: web::Payload, limit: usize) -> Result<Bytes, IngestError> {
    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|err| IngestError::Payload(err.to_string()))?;
        if body.len() + chunk.len() > limit {
            return Err(IngestError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// Take the `image` field, or the first field carrying a file name.
async fn read_multipart_image(
    mut multipart: Multipart,
    limit: usize,
) -> Result<Bytes, IngestError> {
    let mut image = None;
    while let Some(mut field) = multipart
        .try_next()
        .await
        .map_err(|err| IngestError::Multipart(err.to_string()))?
    {
        let named_image = field.name() == Some("image");
        let has_file = field
            .content_disposition()
            .and_then(|disposition| disposition.get_filename())
            .is_some();
        let wanted = named_image || (image.is_none() && has_file);

        let mut data = BytesMut::new();
        while let Some(chunk) = field
            .try_next()
            .await
            .map_err(|err| IngestError::Multipart(err.to_string()))?
        {
            if !wanted {
                continue;
            }
            if data.len() + chunk.len() > limit {
                return Err(IngestError::TooLarge { limit });
            }
            data.extend_from_slice(&chunk);
        }

        if wanted {
            image = Some(data.freeze());
            if named_image {
                break;
            }
        }
    }
    image.ok_or(IngestError::MissingImageField)
}

fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// Stream the latest frame as MJPEG, one part per tick, until the client
/// goes away.
async fn stream_handler(state: web::Data<AppState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(state.stream_interval);
        loop {
            interval.tick().await;
            let part = match state.store.latest_frame() {
                Some(packet) => mjpeg_part(&packet.jpeg),
                None => mjpeg_part(&state.placeholder),
            };
            yield Ok::<Bytes, actix_web::Error>(part);
        }
    };

    live_response()
        .insert_header((
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        ))
        .streaming(stream)
}

async fn latest_image_handler(state: web::Data<AppState>) -> HttpResponse {
    match state.store.latest_frame() {
        Some(packet) => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .insert_header(("X-Frame-Number", packet.frame_number.to_string()))
            .content_type("image/jpeg")
            .body(packet.jpeg),
        None => HttpResponse::Ok()
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .content_type("image/jpeg")
            .body(state.placeholder.clone()),
    }
}

async fn get_detection_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.store.latest_summary())
}

/// Replace the stored summary wholesale, bypassing the detector.
async fn replace_detection_handler(
    state: web::Data<AppState>,
    summary: web::Json<DetectionSummary>,
) -> HttpResponse {
    let summary = summary.into_inner();
    info!(
        detected = summary.detected(),
        count = summary.count(),
        "detection summary replaced externally"
    );
    state.store.replace_summary(summary.clone());
    HttpResponse::Ok().json(json!({ "success": true, "detection": summary }))
}

/// Keeps the subscriber gauge current for the lifetime of one SSE response.
struct Subscription {
    events: EventReceiver,
    sink: Arc<NotificationSink>,
}

impl Subscription {
    fn new(sink: Arc<NotificationSink>) -> Self {
        let events = sink.subscribe();
        metrics::gauge!("vision_push_subscribers").set(sink.subscriber_count() as f64);
        Self { events, sink }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // The receiver is still counted until this returns.
        let remaining = self.sink.subscriber_count().saturating_sub(1);
        metrics::gauge!("vision_push_subscribers").set(remaining as f64);
        debug!(remaining, "push subscriber disconnected");
    }
}

/// Push subscription as Server-Sent Events. Slow clients skip the events they
/// lagged behind on.
async fn events_handler(state: web::Data<AppState>) -> HttpResponse {
    let mut subscription = Subscription::new(state.sink.clone());
    let initial = PushEvent::Initial {
        recent_files: state
            .ingestor
            .archive()
            .map(|archive| archive.recent(RECENT_FILE_LIMIT))
            .unwrap_or_default(),
        last_location: state.locations.last(),
    };
    let keep_alive = state.keep_alive;

    let stream = stream! {
        yield Ok::<Bytes, actix_web::Error>(Bytes::from_static(b"retry: 1000\n\n"));
        match initial.to_sse() {
            Ok(chunk) => yield Ok::<Bytes, actix_web::Error>(Bytes::from(chunk)),
            Err(err) => warn!("failed to encode initial push snapshot: {err}"),
        }

        let mut ticker = actix_web::rt::time::interval(keep_alive);
        ticker.tick().await;
        loop {
            let chunk = tokio::select! {
                received = subscription.events.recv() => match received {
                    Ok(event) => match event.to_sse() {
                        Ok(chunk) => Bytes::from(chunk),
                        Err(err) => {
                            warn!(event = event.name(), "failed to encode push event: {err}");
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "push subscriber lagged; dropping oldest events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => Bytes::from_static(b": keep-alive\n\n"),
            };
            yield Ok::<Bytes, actix_web::Error>(chunk);
        }
    };

    live_response()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CONNECTION, "keep-alive"))
        .streaming(stream)
}

fn coordinate(body: &Map<String, Value>, name: &str, bound: f64) -> Result<f64, ApiError> {
    let value = match body.get(name) {
        None | Some(Value::Null) => {
            return Err(ApiError::BadRequest(
                "Missing latitude or longitude".to_string(),
            ));
        }
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match value {
        Some(v) if v.is_finite() && v.abs() <= bound => Ok(v),
        Some(_) => Err(ApiError::BadRequest(format!("{name} out of range"))),
        None => Err(ApiError::BadRequest(format!("{name} must be a number"))),
    }
}

async fn location_handler(
    state: web::Data<AppState>,
    body: web::Json<Map<String, Value>>,
) -> Result<HttpResponse, ApiError> {
    let latitude = coordinate(&body, "latitude", 90.0)?;
    let longitude = coordinate(&body, "longitude", 180.0)?;

    state.locations.update(Location {
        latitude,
        longitude,
    });
    state
        .sink
        .log(format!("Location updated: {latitude}, {longitude}"));
    state.sink.publish(PushEvent::NewLocation {
        latitude,
        longitude,
        time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    });

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "latitude": latitude,
        "longitude": longitude,
    })))
}

async fn classified_handler(
    state: web::Data<AppState>,
    filename: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let filename = filename.into_inner();
    let path = state
        .ingestor
        .archive()
        .and_then(|archive| archive.resolve(&filename))
        .ok_or_else(|| ApiError::NotFound(filename.clone()))?;

    let content_type = if filename.to_ascii_lowercase().ends_with(".png") {
        "image/png"
    } else {
        "image/jpeg"
    };
    let bytes = web::block(move || std::fs::read(path))
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .map_err(|err| ApiError::Internal(format!("failed to read {filename}: {err}")))?;
    Ok(HttpResponse::Ok().content_type(content_type).body(bytes))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    detector: &'static str,
    model_loaded: bool,
    frames_received: u64,
    frames_admitted: u64,
    frames_skipped: u64,
    subscribers: usize,
}

async fn health_handler(state: web::Data<AppState>) -> HttpResponse {
    let gate = state.ingestor.gate();
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        detector: state.ingestor.detector_name(),
        model_loaded: state.ingestor.model_loaded(),
        frames_received: gate.arrivals(),
        frames_admitted: gate.admitted(),
        frames_skipped: gate.skipped(),
        subscribers: state.sink.subscriber_count(),
    })
}

async fn logs_handler(state: web::Data<AppState>) -> HttpResponse {
    let logs: Vec<String> = state
        .sink
        .recent_logs()
        .iter()
        .map(|entry| entry.line())
        .collect();
    HttpResponse::Ok().json(json!({ "logs": logs }))
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
