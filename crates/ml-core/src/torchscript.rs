//! TorchScript YOLOv5 backend.
//!
//! Expects a model exported with `torch.jit.trace` whose forward pass returns
//! `[1, N, 5 + classes]` rows of `cx, cy, w, h, objectness, class scores...`
//! in input-pixel units.

use std::{path::Path, sync::Mutex};

use anyhow::{Result, anyhow, bail};
use image::{RgbImage, imageops::FilterType};
use tch::{self, Device, Kind, Tensor};

use crate::detector::{Detector, RawDetection};

const MAX_DETECTIONS: usize = 300;

/// TorchScript-backed detector wrapper.
pub struct TorchScriptDetector {
    module: Mutex<tch::CModule>,
    device: Device,
    input_size: i64,
    min_score: f32,
    iou_threshold: f32,
}

impl TorchScriptDetector {
    /// Load a TorchScript module on the best available device.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: i64) -> Result<Self> {
        let device = Device::cuda_if_available();
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module: Mutex::new(module),
            device,
            input_size,
            min_score: 0.05,
            iou_threshold: 0.45,
        })
    }

    /// Override the IoU threshold used for non-maximum suppression.
    pub fn with_iou_threshold(mut self, iou: f32) -> Self {
        self.iou_threshold = iou;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn to_tensor(&self, image: &RgbImage) -> Tensor {
        let edge = self.input_size as u32;
        let resized = image::imageops::resize(image, edge, edge, FilterType::Triangle);
        Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, self.input_size, self.input_size, 3])
            .permute([0, 3, 1, 2])
            / 255.0
    }
}

impl Detector for TorchScriptDetector {
    fn name(&self) -> &'static str {
        "torchscript"
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let input = self.to_tensor(image);
        let output = {
            let module = self
                .module
                .lock()
                .map_err(|_| anyhow!("torchscript module poisoned"))?;
            module.forward_ts(&[input])?
        };
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[2] < 6 {
            bail!(
                "detector output requires at least 6 channels (x,y,w,h,obj,cls), got {}",
                shape[2]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .squeeze_dim(0)
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let scale_x = image.width() as f32 / self.input_size as f32;
        let scale_y = image.height() as f32 / self.input_size as f32;
        let mut candidates = Vec::new();
        for row in rows {
            let objectness = row[4];
            if objectness < self.min_score {
                continue;
            }
            let Some((class_idx, class_score)) = row[5..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            let score = objectness * class_score;
            if score < self.min_score {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            candidates.push(RawDetection {
                bbox: [
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ],
                score,
                class_id: class_idx as i64,
            });
        }

        Ok(non_max_suppression(candidates, self.iou_threshold))
    }
}

/// Greedy per-class NMS, keeping at most `MAX_DETECTIONS` boxes.
fn non_max_suppression(
    mut candidates: Vec<RawDetection>,
    iou_threshold: f32,
) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<RawDetection> = Vec::new();
    for candidate in candidates {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
            if kept.len() >= MAX_DETECTIONS {
                break;
            }
        }
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}
