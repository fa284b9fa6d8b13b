//! Drawing primitives for annotated frames and the waiting placeholder.
//!
//! Boxes are drawn with `imageproc`; captions use a built-in 5x7 bitmap font so
//! no font asset has to ship with the server.

use anyhow::{Result, anyhow};
use image::{Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut},
    rect::Rect,
};
use ml_core::ObstacleClass;

use crate::data::DetectionRecord;

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = 6;
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const LABEL_TEXT: Rgb<u8> = Rgb([255, 255, 255]);
const DEFAULT_BOX: Rgb<u8> = Rgb([0, 255, 0]);

/// Per-class box colours, indexed by class id.
const CLASS_COLORS: [Rgb<u8>; 10] = [
    Rgb([255, 0, 0]),
    Rgb([0, 255, 0]),
    Rgb([0, 0, 255]),
    Rgb([255, 255, 0]),
    Rgb([255, 0, 255]),
    Rgb([0, 255, 255]),
    Rgb([128, 0, 128]),
    Rgb([128, 128, 0]),
    Rgb([0, 128, 128]),
    Rgb([128, 0, 0]),
];

/// Draw every detection on a copy of `original`.
///
/// All detections get a rectangle; only those above `label_threshold` get a
/// filled caption so dense scenes stay readable.
pub(crate) fn annotate(
    original: &RgbImage,
    detections: &[DetectionRecord],
    label_threshold: f32,
) -> RgbImage {
    let mut image = original.clone();
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image;
    }
    let scale = text_scale(width);

    for det in detections {
        let color = class_color(&det.class);
        let left = det.bbox[0].clamp(0.0, (width - 1) as f32).round() as i32;
        let top = det.bbox[1].clamp(0.0, (height - 1) as f32).round() as i32;
        let right = det.bbox[2].clamp(0.0, (width - 1) as f32).round() as i32;
        let bottom = det.bbox[3].clamp(0.0, (height - 1) as f32).round() as i32;
        draw_box(&mut image, left, top, right, bottom, color);

        if det.confidence > label_threshold {
            let text = format!("{} {:.0}%", det.class, det.confidence * 100.0);
            let text_width = text.chars().count() as i32 * GLYPH_ADVANCE * scale;
            let text_height = GLYPH_HEIGHT * scale;
            let label_y = (top - text_height - 2 * scale).max(0);
            fill_rect(
                &mut image,
                left,
                label_y,
                text_width + 2 * scale,
                text_height + 2 * scale,
                LABEL_BACKGROUND,
            );
            draw_label(&mut image, left + scale, label_y + scale, &text, scale, LABEL_TEXT);
        }
    }
    image
}

/// Dark frame with a centred caption, served before the first frame exists.
pub(crate) fn placeholder(width: u32, height: u32, caption: &str) -> RgbImage {
    let mut image = RgbImage::from_pixel(width.max(1), height.max(1), Rgb([32, 32, 32]));
    let scale = text_scale(width).max(2);
    let text_width = caption.chars().count() as i32 * GLYPH_ADVANCE * scale;
    let x = ((width as i32 - text_width) / 2).max(0);
    let y = ((height as i32 - GLYPH_HEIGHT * scale) / 2).max(0);
    draw_label(&mut image, x, y, caption, scale, Rgb([200, 200, 200]));
    image
}

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn text_scale(width: u32) -> i32 {
    ((width / 320) as i32).clamp(1, 4)
}

fn class_color(label: &str) -> Rgb<u8> {
    ObstacleClass::ALL
        .iter()
        .position(|class| class.code() == label)
        .map(|idx| CLASS_COLORS[idx])
        .unwrap_or(DEFAULT_BOX)
}

fn draw_box(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let w = (right - left).max(0) as u32 + 1;
    let h = (bottom - top).max(0) as u32 + 1;
    draw_hollow_rect_mut(image, Rect::at(left, top).of_size(w, h), color);
    if w > 2 && h > 2 {
        draw_hollow_rect_mut(image, Rect::at(left + 1, top + 1).of_size(w - 2, h - 2), color);
    }
}

fn fill_rect(image: &mut RgbImage, x: i32, y: i32, w: i32, h: i32, color: Rgb<u8>) {
    if w <= 0 || h <= 0 {
        return;
    }
    draw_filled_rect_mut(image, Rect::at(x, y).of_size(w as u32, h as u32), color);
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, scale: i32, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = x + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if px >= 0 && px < width && py >= 0 && py < height {
                                image.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}
