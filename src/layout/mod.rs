mod align;
mod filter;
mod geom;
mod order;
mod overlap;

use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use serde::{Deserialize, Serialize};

pub use align::{AlignedInstance, AlignedSet, Alignment, CropOptions, align_and_crop};
pub use filter::filter_instances;
pub use geom::{containment_ratio, median, polygon_area, polygon_bbox, polygon_centroid};
pub use order::{MarginaliaConfig, ReadingOrder, order_lines, order_regions_marginalia};
pub use overlap::{CleanInstanceSet, resolve_overlaps};

/// Axis-aligned pixel rectangle; `x`/`y` is the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBoxPx {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BBoxPx {
    pub fn right(&self) -> u32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.h
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.w as f32 * 0.5,
            self.y as f32 + self.h as f32 * 0.5,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Closed boundary; the last point connects back to the first and is not repeated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub points: Vec<Point>,
}

impl Polygon {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn from_pairs(pairs: &[[f32; 2]]) -> Self {
        Self {
            points: pairs.iter().map(|[x, y]| Point::new(*x, *y)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn area(&self) -> f32 {
        polygon_area(&self.points)
    }

    pub fn bbox(&self) -> Option<BBoxPx> {
        polygon_bbox(&self.points)
    }

    pub fn centroid(&self) -> Option<Point> {
        polygon_centroid(&self.points)
    }
}

/// Binary instance mask in the working frame of the model that produced it.
///
/// Only the tight bounding region of the foreground is stored; `origin` is the
/// position of that region inside the `frame`. Any non-zero pixel is foreground.
#[derive(Debug, Clone)]
pub struct Mask {
    frame: (u32, u32),
    origin: (u32, u32),
    bitmap: GrayImage,
    area: u64,
}

impl Mask {
    pub fn empty(frame_width: u32, frame_height: u32) -> Self {
        Self {
            frame: (frame_width, frame_height),
            origin: (0, 0),
            bitmap: GrayImage::new(0, 0),
            area: 0,
        }
    }

    /// Builds a mask from a bitmap covering the whole model frame.
    pub fn from_bitmap(frame: &GrayImage) -> Self {
        let (width, height) = frame.dimensions();
        let mut min_x = u32::MAX;
        let mut min_y = u32::MAX;
        let mut max_x = 0u32;
        let mut max_y = 0u32;
        let mut area = 0u64;
        for (x, y, pixel) in frame.enumerate_pixels() {
            if pixel[0] == 0 {
                continue;
            }
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        if area == 0 {
            return Self::empty(width, height);
        }
        let bitmap = image::imageops::crop_imm(
            frame,
            min_x,
            min_y,
            max_x - min_x + 1,
            max_y - min_y + 1,
        )
        .to_image();
        Self {
            frame: (width, height),
            origin: (min_x, min_y),
            bitmap,
            area,
        }
    }

    /// Rasterizes a polygon given in frame coordinates.
    pub fn from_polygon(polygon: &Polygon, frame_width: u32, frame_height: u32) -> Self {
        let mut canvas = GrayImage::new(frame_width, frame_height);
        let mut points: Vec<imageproc::point::Point<i32>> = Vec::new();
        for point in &polygon.points {
            let p = imageproc::point::Point::new(point.x.round() as i32, point.y.round() as i32);
            if points.last() != Some(&p) {
                points.push(p);
            }
        }
        while points.len() > 1 && points.first() == points.last() {
            points.pop();
        }
        if points.len() < 3 || frame_width == 0 || frame_height == 0 {
            return Self::empty(frame_width, frame_height);
        }
        draw_polygon_mut(&mut canvas, &points, Luma([255u8]));
        Self::from_bitmap(&canvas)
    }

    pub fn frame(&self) -> (u32, u32) {
        self.frame
    }

    pub fn area(&self) -> u64 {
        self.area
    }

    pub fn is_empty(&self) -> bool {
        self.area == 0
    }

    /// Tight foreground rectangle in frame coordinates, `None` for an empty mask.
    pub fn bbox(&self) -> Option<BBoxPx> {
        if self.is_empty() {
            return None;
        }
        Some(BBoxPx {
            x: self.origin.0,
            y: self.origin.1,
            w: self.bitmap.width(),
            h: self.bitmap.height(),
        })
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        let (ox, oy) = self.origin;
        if x < ox || y < oy {
            return false;
        }
        let (lx, ly) = (x - ox, y - oy);
        if lx >= self.bitmap.width() || ly >= self.bitmap.height() {
            return false;
        }
        self.bitmap.get_pixel(lx, ly)[0] != 0
    }

    /// Number of foreground pixels shared with `other` (same frame assumed).
    pub fn intersection_area(&self, other: &Mask) -> u64 {
        let (Some(a), Some(b)) = (self.bbox(), other.bbox()) else {
            return 0;
        };
        let Some(overlap) = geom::bbox_intersection(&a, &b) else {
            return 0;
        };
        let mut count = 0u64;
        for y in overlap.y..overlap.bottom() {
            for x in overlap.x..overlap.right() {
                if self.contains(x, y) && other.contains(x, y) {
                    count += 1;
                }
            }
        }
        count
    }

    pub fn centroid(&self) -> Option<Point> {
        if self.is_empty() {
            return None;
        }
        let mut sum_x = 0f64;
        let mut sum_y = 0f64;
        for (x, y, pixel) in self.bitmap.enumerate_pixels() {
            if pixel[0] != 0 {
                sum_x += (x + self.origin.0) as f64 + 0.5;
                sum_y += (y + self.origin.1) as f64 + 0.5;
            }
        }
        let n = self.area as f64;
        Some(Point::new((sum_x / n) as f32, (sum_y / n) as f32))
    }

    pub(crate) fn origin(&self) -> (u32, u32) {
        self.origin
    }

    pub(crate) fn bitmap(&self) -> &GrayImage {
        &self.bitmap
    }

    pub(crate) fn from_parts(frame: (u32, u32), origin: (u32, u32), bitmap: GrayImage) -> Self {
        let local = Self::from_bitmap(&bitmap);
        if local.is_empty() {
            return Self::empty(frame.0, frame.1);
        }
        Self {
            frame,
            origin: (origin.0 + local.origin.0, origin.1 + local.origin.1),
            bitmap: local.bitmap,
            area: local.area,
        }
    }
}

/// One prediction of a segmentation model.
#[derive(Debug, Clone)]
pub struct RawInstance {
    pub mask: Mask,
    pub score: f32,
}

impl RawInstance {
    pub fn new(mask: Mask, score: f32) -> Self {
        Self { mask, score }
    }

    pub fn bbox(&self) -> Option<BBoxPx> {
        self.mask.bbox()
    }
}
