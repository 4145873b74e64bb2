use super::{BBoxPx, median};

/// A permutation of `0..n` giving the reading order of `n` instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadingOrder(Vec<usize>);

impl ReadingOrder {
    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_permutation_of(&self, n: usize) -> bool {
        if self.0.len() != n {
            return false;
        }
        let mut seen = vec![false; n];
        for &idx in &self.0 {
            if idx >= n || seen[idx] {
                return false;
            }
            seen[idx] = true;
        }
        true
    }

    /// Moves `items` into reading order.
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
        self.0
            .iter()
            .filter_map(|&idx| slots.get_mut(idx).and_then(Option::take))
            .collect()
    }
}

/// Tunables of the region ordering heuristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginaliaConfig {
    /// Horizontal-center gap, as a fraction of page width, that starts a new column.
    pub column_gap_ratio: f32,
    /// A column holding at least this share of the dominant column's area is body text.
    pub main_column_min_share: f32,
    /// Regions smaller than this fraction of the median body region are marginalia.
    pub marginalia_min_area_ratio: f32,
}

impl Default for MarginaliaConfig {
    fn default() -> Self {
        Self {
            column_gap_ratio: 0.1,
            main_column_min_share: 0.5,
            marginalia_min_area_ratio: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Item {
    idx: usize,
    cx: f32,
    cy: f32,
    area: f32,
}

impl Item {
    fn from_bbox(idx: usize, bbox: &BBoxPx) -> Self {
        let (cx, cy) = bbox.center();
        Self {
            idx,
            cx,
            cy,
            area: bbox.area() as f32,
        }
    }
}

struct Column {
    members: Vec<Item>,
    area: f32,
    mean_cx: f32,
    left: f32,
    right: f32,
}

impl Column {
    fn new(members: Vec<Item>, boxes: &[BBoxPx]) -> Self {
        let area = members.iter().map(|m| m.area).sum();
        let mean_cx = members.iter().map(|m| m.cx).sum::<f32>() / members.len().max(1) as f32;
        let left = members
            .iter()
            .map(|m| boxes[m.idx].x as f32)
            .fold(f32::INFINITY, f32::min);
        let right = members
            .iter()
            .map(|m| boxes[m.idx].right() as f32)
            .fold(f32::NEG_INFINITY, f32::max);
        Self {
            members,
            area,
            mean_cx,
            left,
            right,
        }
    }
}

/// Orders regions column by column, then appends marginal annotations.
///
/// Columns are clusters of horizontal centers. The column with the largest total
/// area is body text, as is any column with a comparable area. Regions of the
/// remaining columns whose center lies within the body span join the nearest body
/// column; the rest, and any region that is tiny next to the body regions, are
/// marginalia. Body columns read left to right, each top to bottom; marginalia
/// follow, top to bottom.
pub fn order_regions_marginalia(
    boxes: &[BBoxPx],
    page_width: u32,
    config: &MarginaliaConfig,
) -> ReadingOrder {
    if boxes.is_empty() {
        return ReadingOrder::default();
    }
    let extent = boxes
        .iter()
        .map(|b| b.right())
        .max()
        .unwrap_or(0)
        .max(page_width)
        .max(1);
    let gap_limit = config.column_gap_ratio * extent as f32;

    let mut items: Vec<Item> = boxes
        .iter()
        .enumerate()
        .map(|(idx, bbox)| Item::from_bbox(idx, bbox))
        .collect();
    items.sort_by(|a, b| a.cx.total_cmp(&b.cx).then(a.idx.cmp(&b.idx)));

    let mut columns: Vec<Column> = Vec::new();
    let mut current: Vec<Item> = Vec::new();
    for item in items {
        if let Some(last) = current.last()
            && item.cx - last.cx > gap_limit
        {
            columns.push(Column::new(std::mem::take(&mut current), boxes));
        }
        current.push(item);
    }
    if !current.is_empty() {
        columns.push(Column::new(current, boxes));
    }

    let dominant_area = columns.iter().map(|c| c.area).fold(0.0, f32::max);
    let (mut body, minor): (Vec<Column>, Vec<Column>) = columns
        .into_iter()
        .partition(|c| c.area >= config.main_column_min_share * dominant_area);

    let body_left = body.iter().map(|c| c.left).fold(f32::INFINITY, f32::min);
    let body_right = body.iter().map(|c| c.right).fold(f32::NEG_INFINITY, f32::max);

    let mut marginalia: Vec<Item> = Vec::new();
    for column in minor {
        for item in column.members {
            if item.cx >= body_left && item.cx <= body_right {
                let nearest = body
                    .iter_mut()
                    .min_by(|a, b| {
                        (a.mean_cx - item.cx)
                            .abs()
                            .total_cmp(&(b.mean_cx - item.cx).abs())
                    });
                if let Some(column) = nearest {
                    column.members.push(item);
                    continue;
                }
            }
            marginalia.push(item);
        }
    }

    let body_areas: Vec<f32> = body
        .iter()
        .flat_map(|c| c.members.iter().map(|m| m.area))
        .collect();
    let small_limit = median(&body_areas).unwrap_or(0.0) * config.marginalia_min_area_ratio;
    for column in body.iter_mut() {
        let (keep, small): (Vec<Item>, Vec<Item>) = column
            .members
            .drain(..)
            .partition(|m| m.area >= small_limit);
        column.members = keep;
        marginalia.extend(small);
    }

    body.sort_by(|a, b| a.mean_cx.total_cmp(&b.mean_cx));
    let mut order = Vec::with_capacity(boxes.len());
    for mut column in body {
        sort_top_to_bottom(&mut column.members);
        order.extend(column.members.iter().map(|m| m.idx));
    }
    sort_top_to_bottom(&mut marginalia);
    order.extend(marginalia.iter().map(|m| m.idx));
    ReadingOrder(order)
}

fn sort_top_to_bottom(items: &mut [Item]) {
    items.sort_by(|a, b| {
        a.cy.total_cmp(&b.cy)
            .then(a.cx.total_cmp(&b.cx))
            .then(a.idx.cmp(&b.idx))
    });
}

/// Orders text lines by horizontal bands.
///
/// A line joins the current band when its vertical center is closer than
/// `line_spacing_factor * median line height` to the band's mean center. Bands
/// read top to bottom, lines inside a band left to right.
pub fn order_lines(boxes: &[BBoxPx], line_spacing_factor: f32) -> ReadingOrder {
    if boxes.is_empty() {
        return ReadingOrder::default();
    }
    let heights: Vec<f32> = boxes.iter().map(|b| b.h as f32).collect();
    let threshold = line_spacing_factor * median(&heights).unwrap_or(0.0);

    let mut items: Vec<Item> = boxes
        .iter()
        .enumerate()
        .map(|(idx, bbox)| Item::from_bbox(idx, bbox))
        .collect();
    sort_top_to_bottom(&mut items);

    let mut bands: Vec<(f32, Vec<Item>)> = Vec::new();
    for item in items {
        if let Some((mean, members)) = bands.last_mut()
            && (item.cy - *mean).abs() < threshold
        {
            members.push(item);
            *mean = members.iter().map(|m| m.cy).sum::<f32>() / members.len() as f32;
            continue;
        }
        bands.push((item.cy, vec![item]));
    }

    bands.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut order = Vec::with_capacity(boxes.len());
    for (_, mut members) in bands {
        members.sort_by(|a, b| {
            a.cx.total_cmp(&b.cx)
                .then(a.cy.total_cmp(&b.cy))
                .then(a.idx.cmp(&b.idx))
        });
        order.extend(members.iter().map(|m| m.idx));
    }
    ReadingOrder(order)
}
