use std::time::Instant;

use image::DynamicImage;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::{Inferencer, LineParams, RegionParams};
use crate::error::{PipelineError, check_factor, check_threshold};
use crate::layout::{BBoxPx, Point, Polygon};
use crate::models::{SegmentationModel, TranscriptionModel};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageParams {
    pub regions: RegionParams,
    /// `lines.strict` aborts the page on the first region (in reading order)
    /// without usable lines.
    pub lines: LineParams,
    /// Threads for the per-region line stage; 0 means one per CPU.
    pub workers: usize,
}

impl Default for PageParams {
    fn default() -> Self {
        Self {
            regions: RegionParams::default(),
            lines: LineParams {
                strict: false,
                ..LineParams::default()
            },
            workers: 0,
        }
    }
}

/// One transcribed line. Geometry is in page coordinates.
#[derive(Debug, Clone)]
pub struct LineResult {
    pub polygon: Polygon,
    pub bbox: BBoxPx,
    pub text: String,
    pub confidence: f32,
    pub crop: DynamicImage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionStatus {
    Transcribed,
    NoLines,
    /// A collaborator failed for this region; siblings were still processed.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct RegionResult {
    /// Position of the region in reading order.
    pub index: usize,
    pub polygon: Polygon,
    pub bbox: BBoxPx,
    pub lines: Vec<LineResult>,
    pub dropped: usize,
    pub status: RegionStatus,
}

#[derive(Debug, Clone, Default)]
pub struct PageResult {
    pub regions: Vec<RegionResult>,
    /// Regions lost to degenerate alignment.
    pub dropped: usize,
}

impl PageResult {
    pub fn line_count(&self) -> usize {
        self.regions.iter().map(|region| region.lines.len()).sum()
    }

    pub fn dropped_lines(&self) -> usize {
        self.regions.iter().map(|region| region.dropped).sum()
    }

    /// Lines joined by newlines, regions separated by a blank line.
    pub fn text(&self) -> String {
        self.regions
            .iter()
            .filter(|region| !region.lines.is_empty())
            .map(|region| {
                region
                    .lines
                    .iter()
                    .map(|line| line.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl<R, L, T> Inferencer<R, L, T>
where
    R: SegmentationModel,
    L: SegmentationModel,
    T: TranscriptionModel,
{
    /// Regions, then lines of every region, then a transcription per line.
    ///
    /// An empty page is an error. Regions are processed on a worker pool; a failing
    /// region is recorded unless `lines.strict` is set.
    pub fn process_page(
        &self,
        image: &DynamicImage,
        params: &PageParams,
    ) -> Result<PageResult, PipelineError> {
        let started = Instant::now();
        check_threshold("pred_score_threshold", params.lines.pred_score_threshold)?;
        check_threshold("containments_threshold", params.lines.containments_threshold)?;
        check_factor("line_spacing_factor", params.lines.line_spacing_factor)?;

        let regions = self.predict_regions(image, &params.regions)?;
        let line_params = params.lines;
        let workers = if params.workers == 0 {
            num_cpus::get()
        } else {
            params.workers
        };

        let count = regions.crops.len();
        let outcomes: Vec<Result<RegionResult, PipelineError>> = if workers > 1 && count > 1 {
            debug!("processing {} regions on {} workers", count, workers);
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()?;
            pool.install(|| {
                regions
                    .crops
                    .par_iter()
                    .zip(regions.boxes.par_iter())
                    .enumerate()
                    .map(|(index, (crop, bbox))| self.process_region(index, crop, *bbox, &line_params))
                    .collect()
            })
        } else {
            debug!("processing {} regions sequentially", count);
            regions
                .crops
                .iter()
                .zip(regions.boxes.iter())
                .enumerate()
                .map(|(index, (crop, bbox))| self.process_region(index, crop, *bbox, &line_params))
                .collect()
        };

        let mut page = PageResult {
            regions: Vec::with_capacity(count),
            dropped: regions.dropped,
        };
        for ((index, outcome), polygon) in outcomes.into_iter().enumerate().zip(regions.polygons) {
            match outcome {
                Ok(mut region) => {
                    region.polygon = polygon;
                    page.regions.push(region);
                }
                Err(err) if line_params.strict => return Err(err),
                Err(err) => {
                    warn!("region {} failed: {}", index, err);
                    page.regions.push(RegionResult {
                        index,
                        polygon,
                        bbox: regions.boxes[index],
                        lines: Vec::new(),
                        dropped: 0,
                        status: RegionStatus::Failed(error_chain(&err)),
                    });
                }
            }
        }

        info!(
            "page done: {} regions, {} lines",
            page.regions.len(),
            page.line_count()
        );
        debug!("process_page finished in {:?}", started.elapsed());
        Ok(page)
    }

    fn process_region(
        &self,
        index: usize,
        crop: &DynamicImage,
        bbox: BBoxPx,
        params: &LineParams,
    ) -> Result<RegionResult, PipelineError> {
        let lines = self.predict_lines_in(Some(index), crop, params)?;
        let dropped = lines.dropped;
        let status = if lines.is_empty() {
            RegionStatus::NoLines
        } else {
            RegionStatus::Transcribed
        };

        let mut results = Vec::with_capacity(lines.crops.len());
        for ((line_crop, polygon), line_box) in
            lines.crops.into_iter().zip(lines.polygons).zip(lines.boxes)
        {
            let transcription = self.transcribe_in(Some(index), &line_crop)?;
            results.push(LineResult {
                polygon: shift_polygon(polygon, bbox),
                bbox: BBoxPx {
                    x: line_box.x + bbox.x,
                    y: line_box.y + bbox.y,
                    ..line_box
                },
                text: transcription.text,
                confidence: transcription.confidence,
                crop: line_crop,
            });
        }
        debug!("region {}: {} lines transcribed", index, results.len());
        Ok(RegionResult {
            index,
            polygon: Polygon::default(),
            bbox,
            lines: results,
            dropped,
            status,
        })
    }
}

fn shift_polygon(polygon: Polygon, by: BBoxPx) -> Polygon {
    Polygon::new(
        polygon
            .points
            .into_iter()
            .map(|p| Point::new(p.x + by.x as f32, p.y + by.y as f32))
            .collect(),
    )
}

fn error_chain(err: &PipelineError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;
    use crate::layout::RawInstance;
    use crate::test_util::{
        FnSegmentation, IdentityPreprocessor, SizeTranscriber, fixed_segmentation,
        gradient_image, scored_rect, stripes,
    };
    use anyhow::anyhow;
    use image::GenericImageView;

    fn regions() -> Vec<RawInstance> {
        vec![
            scored_rect(400, 300, 330, 10, 50, 40, 0.8),
            scored_rect(400, 300, 20, 160, 250, 100, 0.9),
            scored_rect(400, 300, 20, 20, 250, 120, 0.9),
        ]
    }

    // Upper block has two lines, lower block breaks the backend, the note has none.
    fn line_backend(image: &DynamicImage) -> anyhow::Result<Vec<RawInstance>> {
        match image.dimensions() {
            (_, 100) => Err(anyhow!("line backend crashed")),
            (250, _) => Ok(stripes(image, 2)),
            _ => Ok(Vec::new()),
        }
    }

    fn inferencer() -> Inferencer<
        impl SegmentationModel,
        impl SegmentationModel,
        SizeTranscriber,
    > {
        Inferencer::new(fixed_segmentation(regions()), FnSegmentation::new(line_backend))
            .with_preprocessor(IdentityPreprocessor)
            .with_transcriber(SizeTranscriber)
    }

    #[test]
    fn lenient_page_records_every_region() {
        let page = inferencer()
            .process_page(&gradient_image(400, 300), &PageParams::default())
            .expect("page");
        let statuses: Vec<&RegionStatus> = page.regions.iter().map(|r| &r.status).collect();
        assert_eq!(statuses[0], &RegionStatus::Transcribed);
        assert!(matches!(statuses[1], RegionStatus::Failed(msg) if msg.contains("line backend crashed")));
        assert_eq!(statuses[2], &RegionStatus::NoLines);

        let first = &page.regions[0];
        assert_eq!((first.bbox.x, first.bbox.y), (20, 20));
        let line_tops: Vec<(u32, u32)> = first.lines.iter().map(|l| (l.bbox.x, l.bbox.y)).collect();
        assert_eq!(line_tops, vec![(45, 44), (45, 92)]);
        assert_eq!(first.lines[0].text, "200x24");
        assert_eq!(first.lines[0].confidence, 0.8765);
        assert!(first.lines[0].polygon.points.iter().all(|p| p.x >= 45.0 && p.y >= 44.0));
        assert_eq!(page.text(), "200x24\n200x24");
    }

    #[test]
    fn strict_page_fails_on_first_bad_region() {
        let mut params = PageParams::default();
        params.lines.strict = true;
        let err = inferencer()
            .process_page(&gradient_image(400, 300), &params)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Model {
                stage: Stage::LinesPredicted,
                region: Some(1),
                ..
            }
        ));
    }

    #[test]
    fn worker_count_does_not_change_results() {
        let image = gradient_image(400, 300);
        let summarize = |workers: usize| {
            let params = PageParams {
                workers,
                ..PageParams::default()
            };
            let page = inferencer().process_page(&image, &params).expect("page");
            page.regions
                .iter()
                .map(|r| (r.bbox, r.lines.len(), r.status.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(summarize(1), summarize(4));
    }

    #[test]
    fn empty_page_is_an_error() {
        let inferencer = Inferencer::new(
            fixed_segmentation(Vec::new()),
            FnSegmentation::new(line_backend),
        )
        .with_transcriber(SizeTranscriber);
        let err = inferencer
            .process_page(&gradient_image(100, 100), &PageParams::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoRegionsDetected));
    }

    #[test]
    fn bad_line_threshold_fails_before_region_stage() {
        let regions = fixed_segmentation(regions());
        let inferencer = Inferencer::new(regions, FnSegmentation::new(line_backend))
            .with_transcriber(SizeTranscriber);
        let mut params = PageParams::default();
        params.lines.containments_threshold = 2.0;
        let err = inferencer
            .process_page(&gradient_image(400, 300), &params)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidThreshold { .. }));
        assert_eq!(inferencer.region_model.calls(), 0);
    }
}
