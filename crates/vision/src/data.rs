//! Shared structs passed between the ingest path, the store, and HTTP handlers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of log lines kept in memory for `/logs`.
pub(crate) const LOG_HISTORY_CAPACITY: usize = 200;

/// Most recent annotated frame, ready to serve.
#[derive(Clone, Debug)]
pub struct FramePacket {
    pub jpeg: Bytes,
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub width: u32,
    pub height: u32,
}

/// One qualifying detection, always in original-image pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionRecord {
    pub class: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],
}

/// Latest detection result exposed to readers.
///
/// `detected`, `count` and `detections` can only be set together, so
/// `detected == (count > 0) == !detections.is_empty()` always holds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SummaryPayload")]
pub struct DetectionSummary {
    detected: bool,
    count: usize,
    object: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f32>,
    detections: Vec<DetectionRecord>,
    timestamp_ms: i64,
}

impl DetectionSummary {
    /// Rank detections by descending confidence and pick the strongest as the
    /// primary object. The sort is stable, so ties keep detector order.
    pub fn new(mut detections: Vec<DetectionRecord>, timestamp_ms: i64) -> Self {
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Self::verbatim(detections, timestamp_ms)
    }

    /// Keep the caller's order; the first detection is the primary object.
    pub fn verbatim(detections: Vec<DetectionRecord>, timestamp_ms: i64) -> Self {
        let (object, confidence) = match detections.first() {
            Some(primary) => (primary.class.clone(), Some(primary.confidence)),
            None => ("none".to_string(), None),
        };
        Self {
            detected: !detections.is_empty(),
            count: detections.len(),
            object,
            confidence,
            detections,
            timestamp_ms,
        }
    }

    pub fn empty(timestamp_ms: i64) -> Self {
        Self::new(Vec::new(), timestamp_ms)
    }

    pub fn detected(&self) -> bool {
        self.detected
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Class of the strongest detection, or `"none"`.
    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn confidence(&self) -> Option<f32> {
        self.confidence
    }

    pub fn detections(&self) -> &[DetectionRecord] {
        &self.detections
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

impl Default for DetectionSummary {
    fn default() -> Self {
        Self::empty(0)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SummaryError {
    #[error("`detected` is {given} but {count} detection(s) were supplied")]
    DetectedMismatch { given: bool, count: usize },
    #[error("`count` is {given} but {actual} detection(s) were supplied")]
    CountMismatch { given: usize, actual: usize },
    #[error("`object` is {given:?} but the first detection is {expected:?}")]
    ObjectMismatch { given: String, expected: String },
    #[error("`confidence` does not match the first detection")]
    ConfidenceMismatch,
    #[error("detection #{index} has confidence {value} outside [0, 1]")]
    Confidence { index: usize, value: f32 },
    #[error("detection #{index} has a non-finite bounding box")]
    BoundingBox { index: usize },
}

/// Wire form accepted when a caller replaces the summary. Mirrors the read
/// shape; `detections` is mandatory and unknown keys are refused.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SummaryPayload {
    #[serde(default)]
    detected: Option<bool>,
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    detections: Vec<DetectionRecord>,
    #[serde(default)]
    timestamp_ms: Option<i64>,
}

impl TryFrom<SummaryPayload> for DetectionSummary {
    type Error = SummaryError;

    fn try_from(payload: SummaryPayload) -> Result<Self, Self::Error> {
        let actual = payload.detections.len();
        if let Some(given) = payload.detected {
            if given != (actual > 0) {
                return Err(SummaryError::DetectedMismatch {
                    given,
                    count: actual,
                });
            }
        }
        if let Some(given) = payload.count {
            if given != actual {
                return Err(SummaryError::CountMismatch { given, actual });
            }
        }
        for (index, det) in payload.detections.iter().enumerate() {
            if !det.confidence.is_finite() || !(0.0..=1.0).contains(&det.confidence) {
                return Err(SummaryError::Confidence {
                    index,
                    value: det.confidence,
                });
            }
            if det.bbox.iter().any(|v| !v.is_finite()) {
                return Err(SummaryError::BoundingBox { index });
            }
        }

        let timestamp_ms = payload
            .timestamp_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let summary = Self::verbatim(payload.detections, timestamp_ms);
        if let Some(given) = payload.object {
            if given != summary.object {
                return Err(SummaryError::ObjectMismatch {
                    given,
                    expected: summary.object,
                });
            }
        }
        if let Some(given) = payload.confidence {
            let matches = summary
                .confidence
                .is_some_and(|primary| (primary - given).abs() <= f32::EPSILON);
            if !matches {
                return Err(SummaryError::ConfidenceMismatch);
            }
        }
        Ok(summary)
    }
}

/// Append-only log line.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub message: String,
}

impl LogEntry {
    pub fn line(&self) -> String {
        format!("[{}] {}", self.timestamp, self.message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Payload of a `new_frame` push event.
#[derive(Clone, Debug, Serialize)]
pub struct FrameEvent {
    pub frame_number: u64,
    pub timestamp_ms: i64,
    pub detected: bool,
    pub count: usize,
    pub object: String,
    pub detections: Vec<DetectionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Base64-encoded JPEG.
    pub image: String,
}

/// Events fanned out to push subscribers.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum PushEvent {
    Initial {
        recent_files: Vec<String>,
        last_location: Option<Location>,
    },
    NewFrame(FrameEvent),
    NewLog {
        log: String,
    },
    NewLocation {
        latitude: f64,
        longitude: f64,
        time: String,
    },
}

impl PushEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::Initial { .. } => "initial",
            PushEvent::NewFrame(_) => "new_frame",
            PushEvent::NewLog { .. } => "new_log",
            PushEvent::NewLocation { .. } => "new_location",
        }
    }

    /// Render as one Server-Sent-Events message.
    pub fn to_sse(&self) -> serde_json::Result<String> {
        let json = serde_json::to_string(self)?;
        let mut chunk = String::with_capacity(json.len() + 32);
        chunk.push_str("event: ");
        chunk.push_str(self.name());
        chunk.push('\n');
        chunk.push_str("data: ");
        chunk.push_str(&json);
        chunk.push_str("\n\n");
        Ok(chunk)
    }
}
