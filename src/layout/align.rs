use image::{DynamicImage, GenericImageView, GrayImage, Luma, Rgb};
use imageproc::contours::{BorderType, find_contours};
use imageproc::geometry::approximate_polygon_dp;
use tracing::debug;

use super::{BBoxPx, CleanInstanceSet, Mask, Point, Polygon, polygon_area};

/// Maps model-frame coordinates onto source-image pixels:
/// `image = (frame - offset) * scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    pub scale_x: f32,
    pub scale_y: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

impl Alignment {
    /// Independent per-axis scaling from a frame onto an image of another size.
    pub fn stretch(frame: (u32, u32), image: (u32, u32)) -> Self {
        Self {
            scale_x: image.0 as f32 / frame.0.max(1) as f32,
            scale_y: image.1 as f32 / frame.1.max(1) as f32,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }

    /// Frame produced by uniform resizing followed by centered padding.
    pub fn letterbox(frame: (u32, u32), image: (u32, u32)) -> Self {
        let fit = (frame.0 as f32 / image.0.max(1) as f32)
            .min(frame.1 as f32 / image.1.max(1) as f32)
            .max(f32::EPSILON);
        Self {
            scale_x: 1.0 / fit,
            scale_y: 1.0 / fit,
            offset_x: (frame.0 as f32 - image.0 as f32 * fit) * 0.5,
            offset_y: (frame.1 as f32 - image.1 as f32 * fit) * 0.5,
        }
    }

    fn is_identity(&self) -> bool {
        self.scale_x == 1.0 && self.scale_y == 1.0 && self.offset_x == 0.0 && self.offset_y == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropOptions {
    /// Douglas-Peucker tolerance in pixels for traced boundaries; 0 keeps every point.
    pub polygon_epsilon: f64,
    /// Paint crop pixels outside the instance mask white.
    pub fill_outside_mask: bool,
}

impl Default for CropOptions {
    fn default() -> Self {
        Self {
            polygon_epsilon: 1.0,
            fill_outside_mask: false,
        }
    }
}

/// One surviving instance in source-image coordinates.
#[derive(Debug, Clone)]
pub struct AlignedInstance {
    /// Position in the clean set the instance came from.
    pub source_index: usize,
    pub score: f32,
    pub mask: Mask,
    pub polygon: Polygon,
    pub bbox: BBoxPx,
    pub crop: DynamicImage,
}

#[derive(Debug, Clone, Default)]
pub struct AlignedSet {
    pub instances: Vec<AlignedInstance>,
    /// Instances that collapsed to nothing after alignment.
    pub dropped: usize,
}

impl AlignedSet {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn bboxes(&self) -> Vec<BBoxPx> {
        self.instances.iter().map(|item| item.bbox).collect()
    }
}

/// Moves every mask into the image frame, traces its boundary and crops the image.
///
/// The output keeps the clean-set order. `alignment` defaults to stretching each
/// mask frame onto the image.
pub fn align_and_crop(
    clean: CleanInstanceSet,
    image: &DynamicImage,
    alignment: Option<Alignment>,
    options: &CropOptions,
) -> AlignedSet {
    let (width, height) = image.dimensions();
    let mut set = AlignedSet::default();

    for (source_index, instance) in clean.into_instances().into_iter().enumerate() {
        let alignment =
            alignment.unwrap_or_else(|| Alignment::stretch(instance.mask.frame(), (width, height)));
        let mask = align_mask(instance.mask, &alignment, width, height);
        if mask.is_empty() {
            debug!("instance {} is degenerate after alignment", source_index);
            set.dropped += 1;
            continue;
        }
        let polygon = trace_polygon(&mask, options.polygon_epsilon);
        let Some(bbox) = crop_rect(&polygon, width, height) else {
            debug!("instance {} has an empty crop", source_index);
            set.dropped += 1;
            continue;
        };
        let crop = extract_crop(image, &mask, bbox, options.fill_outside_mask);
        set.instances.push(AlignedInstance {
            source_index,
            score: instance.score,
            mask,
            polygon,
            bbox,
            crop,
        });
    }
    set
}

fn align_mask(mask: Mask, alignment: &Alignment, width: u32, height: u32) -> Mask {
    if alignment.is_identity() && mask.frame() == (width, height) {
        return mask;
    }
    let Some(src) = mask.bbox() else {
        return Mask::empty(width, height);
    };
    let to_image_x = |fx: f32| (fx - alignment.offset_x) * alignment.scale_x;
    let to_image_y = |fy: f32| (fy - alignment.offset_y) * alignment.scale_y;

    let x0 = to_image_x(src.x as f32).floor().clamp(0.0, width as f32) as u32;
    let y0 = to_image_y(src.y as f32).floor().clamp(0.0, height as f32) as u32;
    let x1 = to_image_x(src.right() as f32).ceil().clamp(0.0, width as f32) as u32;
    let y1 = to_image_y(src.bottom() as f32).ceil().clamp(0.0, height as f32) as u32;
    if x1 <= x0 || y1 <= y0 || alignment.scale_x <= 0.0 || alignment.scale_y <= 0.0 {
        return Mask::empty(width, height);
    }

    let mut bitmap = GrayImage::new(x1 - x0, y1 - y0);
    for (lx, ly, pixel) in bitmap.enumerate_pixels_mut() {
        let fx = (x0 + lx) as f32 + 0.5;
        let fy = (y0 + ly) as f32 + 0.5;
        let sx = fx / alignment.scale_x + alignment.offset_x;
        let sy = fy / alignment.scale_y + alignment.offset_y;
        if sx < 0.0 || sy < 0.0 {
            continue;
        }
        if mask.contains(sx.floor() as u32, sy.floor() as u32) {
            *pixel = Luma([255u8]);
        }
    }
    Mask::from_parts((width, height), (x0, y0), bitmap)
}

/// Outer boundary of the largest connected component, in image pixel coordinates.
fn trace_polygon(mask: &Mask, epsilon: f64) -> Polygon {
    let bitmap = mask.bitmap();
    let (origin_x, origin_y) = mask.origin();
    let mut padded = GrayImage::new(bitmap.width() + 2, bitmap.height() + 2);
    image::imageops::replace(&mut padded, bitmap, 1, 1);

    let best = find_contours::<i32>(&padded)
        .into_iter()
        .filter(|contour| contour.border_type == BorderType::Outer)
        .map(|contour| {
            let points = if epsilon > 0.0 && contour.points.len() > 3 {
                approximate_polygon_dp(&contour.points, epsilon, true)
            } else {
                contour.points
            };
            let polygon = Polygon::new(untangle_ring(
                points
                    .iter()
                    .map(|p| {
                        Point::new(
                            (p.x - 1 + origin_x as i32) as f32,
                            (p.y - 1 + origin_y as i32) as f32,
                        )
                    })
                    .collect(),
            ));
            (polygon_area(&polygon.points), polygon)
        })
        .filter(|(_, polygon)| polygon.points.len() >= 3)
        .max_by(|a, b| a.0.total_cmp(&b.0));

    match best {
        Some((_, polygon)) => polygon,
        None => bbox_polygon(mask),
    }
}

/// Strips zero-width spikes and pinched loops until the ring no longer touches itself.
///
/// One-pixel spurs trace out and back over the same pixels; at a pinch the larger loop wins.
fn untangle_ring(points: Vec<Point>) -> Vec<Point> {
    let mut ring = close_ring(points);
    while ring.len() >= 3 {
        if let Some(index) = find_spike(&ring) {
            ring.remove(index);
        } else if let Some((start, end)) = find_pinch(&ring) {
            let inner = ring[start..end].to_vec();
            let mut outer = ring[..start].to_vec();
            outer.extend_from_slice(&ring[end..]);
            ring = if polygon_area(&inner) >= polygon_area(&outer) {
                inner
            } else {
                outer
            };
        } else {
            break;
        }
        ring = close_ring(ring);
    }
    ring
}

/// A vertex where the path turns straight back along the edge it arrived on.
fn find_spike(ring: &[Point]) -> Option<usize> {
    let n = ring.len();
    (0..n).find(|&i| {
        let prev = ring[(i + n - 1) % n];
        let cur = ring[i];
        let next = ring[(i + 1) % n];
        let (ax, ay) = ((cur.x - prev.x) as f64, (cur.y - prev.y) as f64);
        let (bx, by) = ((next.x - cur.x) as f64, (next.y - cur.y) as f64);
        ax * by - ay * bx == 0.0 && ax * bx + ay * by < 0.0
    })
}

/// First pair of positions holding the same vertex.
fn find_pinch(ring: &[Point]) -> Option<(usize, usize)> {
    (0..ring.len()).find_map(|i| {
        ring[i + 1..]
            .iter()
            .position(|p| *p == ring[i])
            .map(|offset| (i, i + 1 + offset))
    })
}

/// Drops repeated vertices, including a trailing copy of the first one.
fn close_ring(points: Vec<Point>) -> Vec<Point> {
    let mut ring: Vec<Point> = Vec::with_capacity(points.len());
    for point in points {
        if ring.last() != Some(&point) {
            ring.push(point);
        }
    }
    while ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    ring
}

fn bbox_polygon(mask: &Mask) -> Polygon {
    let Some(bbox) = mask.bbox() else {
        return Polygon::default();
    };
    let (x0, y0) = (bbox.x as f32, bbox.y as f32);
    let (x1, y1) = ((bbox.right() - 1) as f32, (bbox.bottom() - 1) as f32);
    Polygon::from_pairs(&[[x0, y0], [x1, y0], [x1, y1], [x0, y1]])
}

/// Pixel rectangle covering the polygon's vertices, clipped to the image.
fn crop_rect(polygon: &Polygon, width: u32, height: u32) -> Option<BBoxPx> {
    let bbox = polygon.bbox()?;
    let x0 = bbox.x.min(width);
    let y0 = bbox.y.min(height);
    let x1 = (bbox.right() + 1).min(width);
    let y1 = (bbox.bottom() + 1).min(height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(BBoxPx {
        x: x0,
        y: y0,
        w: x1 - x0,
        h: y1 - y0,
    })
}

fn extract_crop(image: &DynamicImage, mask: &Mask, bbox: BBoxPx, fill_outside: bool) -> DynamicImage {
    let crop = image.crop_imm(bbox.x, bbox.y, bbox.w, bbox.h);
    if !fill_outside {
        return crop;
    }
    let mut rgb = crop.to_rgb8();
    for (x, y, pixel) in rgb.enumerate_pixels_mut() {
        if !mask.contains(bbox.x + x, bbox.y + y) {
            *pixel = Rgb([255, 255, 255]);
        }
    }
    DynamicImage::ImageRgb8(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::resolve_overlaps;
    use crate::test_util::{gradient_image, scored_rect};

    fn clean_of(instances: Vec<crate::layout::RawInstance>) -> CleanInstanceSet {
        resolve_overlaps(instances, 1.0).expect("resolve")
    }

    #[test]
    fn same_frame_keeps_geometry() {
        let image = gradient_image(100, 60);
        let clean = clean_of(vec![scored_rect(100, 60, 10, 20, 30, 10, 0.9)]);
        let set = align_and_crop(clean, &image, None, &CropOptions::default());
        assert_eq!(set.dropped, 0);
        let item = &set.instances[0];
        assert_eq!(
            item.bbox,
            BBoxPx {
                x: 10,
                y: 20,
                w: 30,
                h: 10
            }
        );
        assert_eq!(item.crop.dimensions(), (30, 10));
        assert!(item.polygon.points.len() >= 4);
    }

    #[test]
    fn half_resolution_masks_scale_up() {
        let image = gradient_image(200, 120);
        let clean = clean_of(vec![scored_rect(100, 60, 10, 20, 30, 10, 0.9)]);
        let set = align_and_crop(clean, &image, None, &CropOptions::default());
        let item = &set.instances[0];
        assert_eq!(
            item.bbox,
            BBoxPx {
                x: 20,
                y: 40,
                w: 60,
                h: 20
            }
        );
        assert_eq!(item.mask.area(), 1200);
    }

    #[test]
    fn letterbox_offset_is_removed() {
        // 100x50 page resized to 50x25 and padded to 50x50: 12.5px bars top and bottom.
        let alignment = Alignment::letterbox((50, 50), (100, 50));
        assert_eq!(alignment.scale_x, 2.0);
        assert_eq!(alignment.offset_y, 12.5);
        let image = gradient_image(100, 50);
        let clean = clean_of(vec![scored_rect(50, 50, 0, 13, 10, 5, 0.9)]);
        let set = align_and_crop(clean, &image, Some(alignment), &CropOptions::default());
        let item = &set.instances[0];
        assert_eq!(item.bbox.x, 0);
        assert_eq!(item.bbox.y, 1);
        assert_eq!(item.bbox.w, 20);
    }

    #[test]
    fn masks_outside_the_image_are_dropped() {
        let image = gradient_image(50, 50);
        let clean = clean_of(vec![
            scored_rect(100, 100, 0, 0, 10, 10, 0.9),
            scored_rect(100, 100, 60, 60, 10, 10, 0.8),
        ]);
        let alignment = Alignment {
            scale_x: 1.0,
            scale_y: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        };
        let set = align_and_crop(clean, &image, Some(alignment), &CropOptions::default());
        assert_eq!(set.len(), 1);
        assert_eq!(set.dropped, 1);
        assert_eq!(set.instances[0].source_index, 0);
    }

    #[test]
    fn output_follows_input_order() {
        let image = gradient_image(100, 100);
        let clean = clean_of(vec![
            scored_rect(100, 100, 60, 60, 10, 10, 0.9),
            scored_rect(100, 100, 0, 0, 10, 10, 0.8),
        ]);
        let set = align_and_crop(clean, &image, None, &CropOptions::default());
        let indices: Vec<usize> = set.instances.iter().map(|i| i.source_index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(set.instances[0].bbox.x, 60);
    }

    #[test]
    fn fill_outside_mask_whitens_background() {
        let image = gradient_image(40, 40);
        let triangle = Polygon::from_pairs(&[[0.0, 0.0], [20.0, 0.0], [0.0, 20.0]]);
        let instance = crate::layout::RawInstance::new(Mask::from_polygon(&triangle, 40, 40), 0.9);
        let options = CropOptions {
            polygon_epsilon: 0.0,
            fill_outside_mask: true,
        };
        let set = align_and_crop(clean_of(vec![instance]), &image, None, &options);
        let crop = set.instances[0].crop.to_rgb8();
        let (w, h) = crop.dimensions();
        assert_eq!(crop.get_pixel(w - 1, h - 1), &Rgb([255, 255, 255]));
        assert_ne!(crop.get_pixel(1, 1), &Rgb([255, 255, 255]));
    }

    fn spur_mask() -> Mask {
        let mut frame = GrayImage::new(40, 30);
        for y in 10..20 {
            for x in 10..20 {
                frame.put_pixel(x, y, Luma([255]));
            }
        }
        for x in 20..30 {
            frame.put_pixel(x, 15, Luma([255]));
        }
        Mask::from_bitmap(&frame)
    }

    fn cross(o: Point, a: Point, b: Point) -> f64 {
        (a.x - o.x) as f64 * (b.y - o.y) as f64 - (a.y - o.y) as f64 * (b.x - o.x) as f64
    }

    fn on_segment(p: Point, a: Point, b: Point) -> bool {
        cross(a, b, p) == 0.0
            && p.x >= a.x.min(b.x)
            && p.x <= a.x.max(b.x)
            && p.y >= a.y.min(b.y)
            && p.y <= a.y.max(b.y)
    }

    fn segments_touch(a: Point, b: Point, c: Point, d: Point) -> bool {
        let (d1, d2) = (cross(a, b, c), cross(a, b, d));
        let (d3, d4) = (cross(c, d, a), cross(c, d, b));
        if d1 * d2 < 0.0 && d3 * d4 < 0.0 {
            return true;
        }
        on_segment(c, a, b) || on_segment(d, a, b) || on_segment(a, c, d) || on_segment(b, c, d)
    }

    fn assert_simple(ring: &[Point]) {
        let n = ring.len();
        assert!(n >= 3, "{:?}", ring);
        for i in 0..n {
            for j in i + 1..n {
                assert_ne!(ring[i], ring[j], "repeated vertex in {:?}", ring);
            }
        }
        for i in 0..n {
            let (a, b) = (ring[i], ring[(i + 1) % n]);
            // Adjacent edges share one endpoint; the far end must not fold back onto the edge.
            let next = ring[(i + 2) % n];
            assert!(!on_segment(next, a, b), "edge folds back at {:?}", b);
            for j in i + 2..n {
                if (j + 1) % n == i {
                    continue;
                }
                let (c, d) = (ring[j], ring[(j + 1) % n]);
                assert!(
                    !segments_touch(a, b, c, d),
                    "edges {} and {} cross in {:?}",
                    i,
                    j,
                    ring
                );
            }
        }
    }

    #[test]
    fn one_pixel_spur_does_not_leave_a_spike() {
        for epsilon in [1.0, 0.0] {
            let image = gradient_image(40, 30);
            let instance = crate::layout::RawInstance::new(spur_mask(), 0.9);
            let options = CropOptions {
                polygon_epsilon: epsilon,
                fill_outside_mask: false,
            };
            let set = align_and_crop(clean_of(vec![instance]), &image, None, &options);
            let polygon = &set.instances[0].polygon;
            assert_simple(&polygon.points);
            assert!(polygon.points.iter().all(|p| p.x < 21.0));
        }
    }

    fn points(pairs: &[[f32; 2]]) -> Vec<Point> {
        pairs.iter().map(|p| Point::new(p[0], p[1])).collect()
    }

    #[test]
    fn spikes_and_pinches_are_removed_from_rings() {
        let ring = untangle_ring(points(&[
            [10.0, 10.0],
            [10.0, 19.0],
            [19.0, 19.0],
            [20.0, 15.0],
            [29.0, 15.0],
            [20.0, 15.0],
            [19.0, 10.0],
        ]));
        assert_eq!(ring.len(), 5);
        assert_simple(&ring);

        // Two squares meeting in one corner: the larger one is kept.
        let ring = untangle_ring(points(&[
            [0.0, 0.0],
            [4.0, 0.0],
            [4.0, 4.0],
            [6.0, 4.0],
            [6.0, 6.0],
            [4.0, 6.0],
            [4.0, 4.0],
            [0.0, 4.0],
        ]));
        assert_eq!(polygon_area(&ring), 16.0);
        assert_simple(&ring);

        let line = untangle_ring(points(&[[0.0, 0.0], [5.0, 0.0], [9.0, 0.0]]));
        assert!(line.len() < 3);
    }

    #[test]
    fn single_pixel_mask_falls_back_to_box_polygon() {
        let image = gradient_image(10, 10);
        let clean = clean_of(vec![scored_rect(10, 10, 4, 4, 1, 1, 0.9)]);
        let set = align_and_crop(clean, &image, None, &CropOptions::default());
        assert_eq!(set.len(), 1);
        assert_eq!(set.instances[0].crop.dimensions(), (1, 1));
    }
}
