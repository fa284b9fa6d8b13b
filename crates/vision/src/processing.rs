//! Decode, detector-input preparation, and detection post-processing.
//!
//! The detector may see a downscaled copy of the frame; everything returned
//! from here is mapped back to the original image's pixel space.

use std::sync::Arc;

use anyhow::Result;
use image::{RgbImage, imageops::FilterType};
use ml_core::{RawDetection, class_label};

use crate::{annotation, data::DetectionRecord};

/// Thresholds and encode settings applied to every admitted frame.
#[derive(Clone, Copy, Debug)]
pub struct DetectionParams {
    /// Detections below this confidence are discarded.
    pub confidence_threshold: f32,
    /// Detections above this confidence get a caption on the overlay.
    pub label_threshold: f32,
    /// Frames wider than this are downscaled before detection.
    pub max_detector_width: u32,
    pub jpeg_quality: u8,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            label_threshold: 0.7,
            max_detector_width: 640,
            jpeg_quality: 85,
        }
    }
}

/// Decoded frame plus the image handed to the detector.
pub(crate) struct PreparedFrame {
    pub(crate) original: Arc<RgbImage>,
    pub(crate) detector_input: Arc<RgbImage>,
    /// `detector_width / original_width`; `1.0` when no resize happened.
    pub(crate) scale: f32,
}

pub(crate) fn prepare(
    bytes: &[u8],
    max_detector_width: u32,
) -> Result<PreparedFrame, image::ImageError> {
    let original = Arc::new(image::load_from_memory(bytes)?.to_rgb8());
    let (width, height) = original.dimensions();
    if width <= max_detector_width || max_detector_width == 0 {
        return Ok(PreparedFrame {
            detector_input: original.clone(),
            original,
            scale: 1.0,
        });
    }

    let scale = max_detector_width as f32 / width as f32;
    let target_height = ((height as f32 * scale).round() as u32).max(1);
    let resized = image::imageops::resize(
        original.as_ref(),
        max_detector_width,
        target_height,
        FilterType::Triangle,
    );
    Ok(PreparedFrame {
        original,
        detector_input: Arc::new(resized),
        scale,
    })
}

/// Drop weak detections, label them, and undo the detector-side resize.
pub(crate) fn qualify(
    raw: Vec<RawDetection>,
    scale: f32,
    confidence_threshold: f32,
) -> Vec<DetectionRecord> {
    raw.into_iter()
        .filter(|det| det.score.is_finite() && det.score >= confidence_threshold)
        .map(|det| {
            let bbox = if scale != 1.0 && scale > 0.0 {
                det.bbox.map(|v| v / scale)
            } else {
                det.bbox
            };
            DetectionRecord {
                class: class_label(det.class_id).into_owned(),
                confidence: round3(det.score.clamp(0.0, 1.0)),
                bbox: bbox.map(round1),
            }
        })
        .collect()
}

/// Annotate the original-resolution frame and encode it.
pub(crate) fn render(
    original: &RgbImage,
    detections: &[DetectionRecord],
    params: &DetectionParams,
) -> Result<Vec<u8>> {
    let annotated = annotation::annotate(original, detections, params.label_threshold);
    annotation::encode_jpeg(&annotated, params.jpeg_quality)
}

fn round3(value: f32) -> f32 {
    (value * 1000.0).round() / 1000.0
}

fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([120, 80, 40]));
        annotation::encode_jpeg(&image, 90).unwrap()
    }

    fn raw(class_id: i64, score: f32, bbox: [f32; 4]) -> RawDetection {
        RawDetection {
            bbox,
            score,
            class_id,
        }
    }

    #[test]
    fn narrow_frames_are_not_resized() {
        let prepared = prepare(&jpeg(640, 480), 640).unwrap();
        assert_eq!(prepared.scale, 1.0);
        assert!(Arc::ptr_eq(&prepared.original, &prepared.detector_input));
    }

    #[test]
    fn wide_frames_are_downscaled_for_detection_only() {
        let prepared = prepare(&jpeg(1280, 960), 640).unwrap();
        assert_eq!(prepared.original.dimensions(), (1280, 960));
        assert_eq!(prepared.detector_input.dimensions(), (640, 480));
        assert_eq!(prepared.scale, 0.5);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(prepare(b"definitely not an image", 640).is_err());
    }

    #[test]
    fn qualify_filters_labels_and_rescales() {
        let records = qualify(
            vec![
                raw(1, 0.82, [50.0, 20.0, 100.0, 80.0]),
                raw(7, 0.1, [0.0, 0.0, 1.0, 1.0]),
                raw(23, 0.3, [10.0, 10.0, 20.0, 20.0]),
            ],
            0.5,
            0.25,
        );
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].class, "do");
        assert_eq!(records[0].bbox, [100.0, 40.0, 200.0, 160.0]);
        assert_eq!(records[1].class, "class_23");
    }

    #[test]
    fn threshold_is_inclusive_and_confidence_rounded() {
        let records = qualify(vec![raw(0, 0.25, [0.0; 4]), raw(0, 0.81234, [0.0; 4])], 1.0, 0.25);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].confidence, 0.812);
    }
}
