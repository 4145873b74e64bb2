use super::{BBoxPx, Mask, Point};

/// Fraction of `a`'s area that lies inside `b`. Zero when `a` is empty.
pub fn containment_ratio(a: &Mask, b: &Mask) -> f32 {
    ratio(a.intersection_area(b), a.area())
}

pub(super) fn ratio(intersection: u64, area: u64) -> f32 {
    if area == 0 {
        return 0.0;
    }
    (intersection as f64 / area as f64) as f32
}

pub(super) fn bbox_intersection(a: &BBoxPx, b: &BBoxPx) -> Option<BBoxPx> {
    let ix1 = a.x.max(b.x);
    let iy1 = a.y.max(b.y);
    let ix2 = a.right().min(b.right());
    let iy2 = a.bottom().min(b.bottom());
    if ix2 <= ix1 || iy2 <= iy1 {
        return None;
    }
    Some(BBoxPx {
        x: ix1,
        y: iy1,
        w: ix2 - ix1,
        h: iy2 - iy1,
    })
}

/// Shoelace area, orientation independent.
pub fn polygon_area(points: &[Point]) -> f32 {
    signed_area(points).abs()
}

fn signed_area(points: &[Point]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut acc = 0f64;
    for (idx, p) in points.iter().enumerate() {
        let q = points[(idx + 1) % points.len()];
        acc += p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
    }
    (acc * 0.5) as f32
}

/// Smallest pixel rectangle enclosing every point; negative coordinates clamp to 0.
pub fn polygon_bbox(points: &[Point]) -> Option<BBoxPx> {
    if points.is_empty() {
        return None;
    }
    let mut min_x = f32::INFINITY;
    let mut min_y = f32::INFINITY;
    let mut max_x = f32::NEG_INFINITY;
    let mut max_y = f32::NEG_INFINITY;
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    let x1 = min_x.floor().max(0.0) as u32;
    let y1 = min_y.floor().max(0.0) as u32;
    let x2 = max_x.ceil().max(0.0) as u32;
    let y2 = max_y.ceil().max(0.0) as u32;
    Some(BBoxPx {
        x: x1,
        y: y1,
        w: x2.saturating_sub(x1),
        h: y2.saturating_sub(y1),
    })
}

/// Area-weighted centroid; falls back to the vertex mean for degenerate shapes.
pub fn polygon_centroid(points: &[Point]) -> Option<Point> {
    if points.is_empty() {
        return None;
    }
    let area = signed_area(points) as f64;
    if area.abs() < 1e-6 {
        let n = points.len() as f32;
        let sx: f32 = points.iter().map(|p| p.x).sum();
        let sy: f32 = points.iter().map(|p| p.y).sum();
        return Some(Point::new(sx / n, sy / n));
    }
    let mut cx = 0f64;
    let mut cy = 0f64;
    for (idx, p) in points.iter().enumerate() {
        let q = points[(idx + 1) % points.len()];
        let cross = p.x as f64 * q.y as f64 - q.x as f64 * p.y as f64;
        cx += (p.x as f64 + q.x as f64) * cross;
        cy += (p.y as f64 + q.y as f64) * cross;
    }
    let factor = 1.0 / (6.0 * area);
    Some(Point::new((cx * factor) as f32, (cy * factor) as f32))
}

/// Median of the values; the mean of the two middle values for even counts.
pub fn median(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) * 0.5)
    } else {
        Some(sorted[mid])
    }
}
