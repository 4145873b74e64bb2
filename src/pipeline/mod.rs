use std::time::Instant;

use anyhow::anyhow;
use image::{DynamicImage, GenericImageView, RgbaImage};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Stage, check_factor, check_threshold};
use crate::layout::{
    AlignedSet, BBoxPx, CropOptions, MarginaliaConfig, Mask, Polygon, ReadingOrder, align_and_crop,
    filter_instances, order_lines, order_regions_marginalia, resolve_overlaps,
};
use crate::models::{
    Binarizer, LoadedTranscriber, Preprocessor, SegmentationModel, Transcription,
    TranscriptionModel,
};

mod page;
mod visualize;

pub use page::{LineResult, PageParams, PageResult, RegionResult, RegionStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionParams {
    pub pred_score_threshold: f32,
    pub containments_threshold: f32,
    pub visualize: bool,
}

impl Default for RegionParams {
    fn default() -> Self {
        Self {
            pred_score_threshold: 0.5,
            containments_threshold: 0.5,
            visualize: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineParams {
    pub pred_score_threshold: f32,
    pub containments_threshold: f32,
    pub line_spacing_factor: f32,
    pub visualize: bool,
    /// Fail with `NoLinesDetected` instead of returning an empty prediction.
    pub strict: bool,
}

impl Default for LineParams {
    fn default() -> Self {
        Self {
            pred_score_threshold: 0.5,
            containments_threshold: 0.5,
            line_spacing_factor: 0.5,
            visualize: false,
            strict: true,
        }
    }
}

/// Regions of a page in reading order. All vectors are index-aligned.
#[derive(Debug, Clone, Default)]
pub struct RegionPrediction {
    pub visualization: Option<RgbaImage>,
    pub crops: Vec<DynamicImage>,
    pub polygons: Vec<Polygon>,
    pub masks: Vec<Mask>,
    /// Crop rectangles in page coordinates.
    pub boxes: Vec<BBoxPx>,
    /// Instances lost to degenerate alignment.
    pub dropped: usize,
}

/// Lines of one region in reading order. Coordinates are relative to the region image.
#[derive(Debug, Clone, Default)]
pub struct LinePrediction {
    pub visualization: Option<RgbaImage>,
    pub crops: Vec<DynamicImage>,
    pub polygons: Vec<Polygon>,
    pub boxes: Vec<BBoxPx>,
    pub dropped: usize,
}

impl LinePrediction {
    pub fn is_empty(&self) -> bool {
        self.crops.is_empty()
    }
}

struct StageNames {
    predicted: Stage,
    filtered: Stage,
    clean: Stage,
    ordered: Stage,
}

const REGION_STAGES: StageNames = StageNames {
    predicted: Stage::RegionsPredicted,
    filtered: Stage::RegionsFiltered,
    clean: Stage::RegionsClean,
    ordered: Stage::RegionsOrdered,
};

const LINE_STAGES: StageNames = StageNames {
    predicted: Stage::LinesPredicted,
    filtered: Stage::LinesFiltered,
    clean: Stage::LinesClean,
    ordered: Stage::LinesOrdered,
};

/// Runs segmentation models through filtering, overlap resolution, cropping and
/// reading order for one page.
pub struct Inferencer<R, L, T = LoadedTranscriber> {
    region_model: R,
    line_model: L,
    transcriber: Option<T>,
    preprocessor: Box<dyn Preprocessor>,
    crop: CropOptions,
    ordering: MarginaliaConfig,
}

impl<R, L> Inferencer<R, L, LoadedTranscriber> {
    pub fn new(region_model: R, line_model: L) -> Self {
        Self {
            region_model,
            line_model,
            transcriber: None,
            preprocessor: Box::new(Binarizer::default()),
            crop: CropOptions::default(),
            ordering: MarginaliaConfig::default(),
        }
    }
}

impl<R, L, T> Inferencer<R, L, T> {
    pub fn with_transcriber<U: TranscriptionModel>(self, transcriber: U) -> Inferencer<R, L, U> {
        Inferencer {
            region_model: self.region_model,
            line_model: self.line_model,
            transcriber: Some(transcriber),
            preprocessor: self.preprocessor,
            crop: self.crop,
            ordering: self.ordering,
        }
    }

    /// Replaces the page preprocessing that runs before region segmentation.
    pub fn with_preprocessor<P: Preprocessor + 'static>(mut self, preprocessor: P) -> Self {
        self.preprocessor = Box::new(preprocessor);
        self
    }

    pub fn with_crop_options(mut self, crop: CropOptions) -> Self {
        self.crop = crop;
        self
    }

    pub fn with_ordering(mut self, ordering: MarginaliaConfig) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn crop_options(&self) -> &CropOptions {
        &self.crop
    }

    pub fn ordering(&self) -> &MarginaliaConfig {
        &self.ordering
    }
}

impl<R: SegmentationModel, L: SegmentationModel, T> Inferencer<R, L, T> {
    /// Binarizes the page, segments it into regions and orders them.
    ///
    /// Fails with `NoRegionsDetected` when nothing usable survives.
    pub fn predict_regions(
        &self,
        image: &DynamicImage,
        params: &RegionParams,
    ) -> Result<RegionPrediction, PipelineError> {
        let started = Instant::now();
        check_threshold("pred_score_threshold", params.pred_score_threshold)?;
        check_threshold("containments_threshold", params.containments_threshold)?;

        let page = self
            .preprocessor
            .binarize(image)
            .map_err(|err| PipelineError::model(Stage::Start, None, err))?;
        let aligned = self.segment(
            &self.region_model,
            &page,
            params.pred_score_threshold,
            params.containments_threshold,
            &REGION_STAGES,
            None,
        )?;
        if aligned.is_empty() {
            warn!("no regions detected ({} dropped)", aligned.dropped);
            return Err(PipelineError::NoRegionsDetected);
        }

        let (width, _) = page.dimensions();
        let order = order_regions_marginalia(&aligned.bboxes(), width, &self.ordering);
        debug!("{}: {:?}", REGION_STAGES.ordered, order.indices());

        let dropped = aligned.dropped;
        let mut prediction = RegionPrediction {
            dropped,
            ..RegionPrediction::default()
        };
        for item in order.apply(aligned.instances) {
            prediction.crops.push(item.crop);
            prediction.polygons.push(item.polygon);
            prediction.masks.push(item.mask);
            prediction.boxes.push(item.bbox);
        }
        if params.visualize {
            prediction.visualization = Some(visualize::draw_overlay(
                &page,
                &prediction.polygons,
                &prediction.boxes,
            ));
        }
        info!(
            "{} regions ordered ({} dropped)",
            prediction.crops.len(),
            dropped
        );
        debug!("predict_regions finished in {:?}", started.elapsed());
        Ok(prediction)
    }

    /// Segments one region image into ordered text lines.
    ///
    /// With `strict` unset an empty region yields an empty prediction.
    pub fn predict_lines(
        &self,
        region_image: &DynamicImage,
        params: &LineParams,
    ) -> Result<LinePrediction, PipelineError> {
        self.predict_lines_in(None, region_image, params)
    }

    pub(crate) fn predict_lines_in(
        &self,
        region: Option<usize>,
        region_image: &DynamicImage,
        params: &LineParams,
    ) -> Result<LinePrediction, PipelineError> {
        let started = Instant::now();
        check_threshold("pred_score_threshold", params.pred_score_threshold)?;
        check_threshold("containments_threshold", params.containments_threshold)?;
        let spacing = check_factor("line_spacing_factor", params.line_spacing_factor)?;

        let aligned = self.segment(
            &self.line_model,
            region_image,
            params.pred_score_threshold,
            params.containments_threshold,
            &LINE_STAGES,
            region,
        )?;
        if aligned.is_empty() {
            if params.strict {
                return Err(PipelineError::NoLinesDetected { region });
            }
            warn!(
                "no lines detected{}, continuing with an empty region",
                region.map(|idx| format!(" in region {}", idx)).unwrap_or_default()
            );
            return Ok(LinePrediction {
                dropped: aligned.dropped,
                ..LinePrediction::default()
            });
        }

        let order: ReadingOrder = order_lines(&aligned.bboxes(), spacing);
        debug!("{}: {:?}", LINE_STAGES.ordered, order.indices());

        let mut prediction = LinePrediction {
            dropped: aligned.dropped,
            ..LinePrediction::default()
        };
        for item in order.apply(aligned.instances) {
            prediction.crops.push(item.crop);
            prediction.polygons.push(item.polygon);
            prediction.boxes.push(item.bbox);
        }
        if params.visualize {
            prediction.visualization = Some(visualize::draw_overlay(
                region_image,
                &prediction.polygons,
                &prediction.boxes,
            ));
        }
        debug!("predict_lines finished in {:?}", started.elapsed());
        Ok(prediction)
    }

    fn segment<M: SegmentationModel>(
        &self,
        model: &M,
        image: &DynamicImage,
        pred_score_threshold: f32,
        containments_threshold: f32,
        stages: &StageNames,
        region: Option<usize>,
    ) -> Result<AlignedSet, PipelineError> {
        let raw = model
            .predict(image)
            .map_err(|err| PipelineError::model(stages.predicted, region, err))?;
        debug!("{}: {} instances", stages.predicted, raw.len());

        let filtered = filter_instances(raw, pred_score_threshold)?;
        debug!("{}: {} instances", stages.filtered, filtered.len());

        let clean = resolve_overlaps(filtered, containments_threshold)?;
        debug!("{}: {} instances", stages.clean, clean.len());

        let (width, height) = image.dimensions();
        let aligned = align_and_crop(clean, image, model.alignment(width, height), &self.crop);
        if aligned.dropped > 0 {
            debug!(
                "{}: {} instances degenerate after alignment",
                stages.clean, aligned.dropped
            );
        }
        Ok(aligned)
    }
}

impl<R, L, T: TranscriptionModel> Inferencer<R, L, T> {
    /// Transcribes one line crop. Confidence is clamped to `[0, 1]` and rounded to
    /// four decimals.
    pub fn transcribe(&self, line_image: &DynamicImage) -> Result<Transcription, PipelineError> {
        self.transcribe_in(None, line_image)
    }

    pub(crate) fn transcribe_in(
        &self,
        region: Option<usize>,
        line_image: &DynamicImage,
    ) -> Result<Transcription, PipelineError> {
        let started = Instant::now();
        let transcriber = self.transcriber.as_ref().ok_or_else(|| {
            PipelineError::model(
                Stage::Transcribed,
                region,
                anyhow!("no transcription model configured"),
            )
        })?;
        let mut out = transcriber
            .transcribe(line_image)
            .map_err(|err| PipelineError::model(Stage::Transcribed, region, err))?;
        out.confidence = round_confidence(out.confidence);
        debug!("transcribe finished in {:?}", started.elapsed());
        Ok(out)
    }
}

fn round_confidence(value: f32) -> f32 {
    if !value.is_finite() {
        return 0.0;
    }
    (value.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}
