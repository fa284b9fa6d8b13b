//! Live frame server for a camera-equipped cane.
//!
//! Uploaded JPEG frames pass a drop-when-busy gate, run through a [`Detector`],
//! get annotated, and land in a single-slot [`FrameStore`]. Dashboards read
//! that slot through an MJPEG stream, a JSON query endpoint, and a
//! Server-Sent-Events push channel fed by the [`NotificationSink`].
//!
//! [`Detector`]: ml_core::Detector
//! [`FrameStore`]: store::FrameStore
//! [`NotificationSink`]: notify::NotificationSink

mod annotation;
pub mod archive;
pub mod data;
pub mod error;
pub mod gate;
pub mod ingest;
pub mod location;
pub mod notify;
pub mod pipeline;
mod processing;
pub mod server;
pub mod store;

pub use data::{DetectionRecord, DetectionSummary, FramePacket, LogEntry, PushEvent};
pub use ingest::{FrameIngestor, FrameResult, IngestOutcome, IngestSettings};
pub use pipeline::{VisionCliArgs, VisionConfig, run};
pub use processing::DetectionParams;
