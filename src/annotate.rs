//! Detection overlays for the annotated stream.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::frame::Frame;

/// Violations draw red, everything else green.
const VIOLATION_COLOR: Rgb<u8> = Rgb([214, 40, 40]);
const COMPLIANT_COLOR: Rgb<u8> = Rgb([64, 190, 80]);
const BOX_THICKNESS: u32 = 2;
/// Height of the filled tag bar drawn over a violation box.
const TAG_BAR_HEIGHT: u32 = 6;

/// Render a frame with detection boxes drawn on a copy of its pixels.
pub fn draw_detections(frame: &Frame, detections: &[Detection]) -> Result<RgbImage> {
    let mut image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone())
        .ok_or_else(|| {
            anyhow!(
                "frame {} buffer does not match {}x{} RGB24",
                frame.index,
                frame.width,
                frame.height
            )
        })?;

    for detection in detections {
        let color = if detection.is_violation() {
            VIOLATION_COLOR
        } else {
            COMPLIANT_COLOR
        };
        draw_box(&mut image, detection, color);
        if detection.is_violation() {
            draw_tag_bar(&mut image, detection, color);
        }
    }
    Ok(image)
}

fn draw_box(image: &mut RgbImage, detection: &Detection, color: Rgb<u8>) {
    let (x, y, width, height) = clamp_box(image, detection);
    for inset in 0..BOX_THICKNESS {
        let w = width.saturating_sub(inset * 2);
        let h = height.saturating_sub(inset * 2);
        if w == 0 || h == 0 {
            break;
        }
        draw_hollow_rect_mut(
            image,
            Rect::at((x + inset) as i32, (y + inset) as i32).of_size(w, h),
            color,
        );
    }
}

fn draw_tag_bar(image: &mut RgbImage, detection: &Detection, color: Rgb<u8>) {
    let (x, y, width, _) = clamp_box(image, detection);
    if width == 0 {
        return;
    }
    // Sits just above the box, clipped to the top edge when the box starts
    // near row zero.
    let bar_y = y.saturating_sub(TAG_BAR_HEIGHT + 2);
    draw_filled_rect_mut(
        image,
        Rect::at(x as i32, bar_y as i32).of_size(width, TAG_BAR_HEIGHT),
        color,
    );
}

/// Clip a detection box to the image bounds. Detectors may emit coordinates
/// slightly past the frame edge.
fn clamp_box(image: &RgbImage, detection: &Detection) -> (u32, u32, u32, u32) {
    let bbox = &detection.bbox;
    let x1 = bbox.x1.min(image.width().saturating_sub(1));
    let y1 = bbox.y1.min(image.height().saturating_sub(1));
    let x2 = bbox.x2.clamp(x1, image.width());
    let y2 = bbox.y2.clamp(y1, image.height());
    (x1, y1, x2 - x1, y2 - y1)
}
