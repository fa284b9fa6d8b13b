use anyhow::Result;
use image::RgbImage;

/// Single detection returned by a detector, in the coordinate space of the
/// image it was given.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawDetection {
    /// `[x1, y1, x2, y2]` in pixels.
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: i64,
}

/// Object detector boundary.
///
/// Implementations may be slow and are always called from a blocking thread.
/// Callers never run two `detect` calls at once on the same server, but the
/// trait still requires `Sync` so a detector can be shared behind an `Arc`.
pub trait Detector: Send + Sync {
    /// Backend identifier used in logs and `/health`.
    fn name(&self) -> &'static str;

    /// Whether a real model is backing this detector.
    fn model_loaded(&self) -> bool {
        true
    }

    /// Run detection. Results are unfiltered; thresholding happens upstream.
    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>>;
}

/// Detector that never finds anything. Used when no model is configured so the
/// stream and push paths still work end to end.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn name(&self) -> &'static str {
        "null"
    }

    fn model_loaded(&self) -> bool {
        false
    }

    fn detect(&self, _image: &RgbImage) -> Result<Vec<RawDetection>> {
        Ok(Vec::new())
    }
}
