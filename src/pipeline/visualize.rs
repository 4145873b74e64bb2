use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::layout::{BBoxPx, Polygon};

const POLYGON_COLOR: Rgba<u8> = Rgba([220, 20, 60, 255]);

const BBOX_COLOR: Rgba<u8> = Rgba([0, 160, 0, 255]);

const BBOX_THICKNESS: u32 = 2;

/// Draws instance boxes and traced boundaries over a copy of `image`.
pub(crate) fn draw_overlay(image: &DynamicImage, polygons: &[Polygon], boxes: &[BBoxPx]) -> RgbaImage {
    let mut canvas = image.to_rgba8();
    for bbox in boxes {
        draw_box(&mut canvas, bbox);
    }
    for polygon in polygons {
        draw_outline(&mut canvas, polygon);
    }
    canvas
}

fn draw_box(canvas: &mut RgbaImage, bbox: &BBoxPx) {
    for inset in 0..BBOX_THICKNESS {
        let w = bbox.w.saturating_sub(2 * inset);
        let h = bbox.h.saturating_sub(2 * inset);
        if w == 0 || h == 0 {
            break;
        }
        let rect = Rect::at((bbox.x + inset) as i32, (bbox.y + inset) as i32).of_size(w, h);
        draw_hollow_rect_mut(canvas, rect, BBOX_COLOR);
    }
}

fn draw_outline(canvas: &mut RgbaImage, polygon: &Polygon) {
    let points = &polygon.points;
    if points.len() < 2 {
        return;
    }
    for (idx, start) in points.iter().enumerate() {
        let end = &points[(idx + 1) % points.len()];
        draw_line_segment_mut(canvas, (start.x, start.y), (end.x, end.y), POLYGON_COLOR);
    }
}
