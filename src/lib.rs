use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub mod error;
pub mod layout;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod settings;

#[cfg(test)]
mod test_util;

pub use error::{PipelineError, Stage};
pub use layout::{BBoxPx, Mask, Point, Polygon, RawInstance};
pub use models::{
    Binarizer, LoadedTranscriber, PrecomputedSegmentation, Preprocessor, SegmentationModel,
    TranscriberRegistry, TranscriberStrategy, Transcription, TranscriptionModel,
};
pub use pipeline::{
    Inferencer, LineParams, LinePrediction, LineResult, PageParams, PageResult, RegionParams,
    RegionPrediction, RegionResult, RegionStatus,
};
pub use settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Regions,
    Lines,
}

/// One command-line invocation: a stage run over an image with replayed predictions.
#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub image: PathBuf,
    pub predictions: PathBuf,
    pub settings_path: Option<PathBuf>,
    pub pred_score_threshold: Option<f32>,
    pub containments_threshold: Option<f32>,
    pub line_spacing_factor: Option<f32>,
    /// Write the overlay PNG here.
    pub visualize: Option<PathBuf>,
    /// Return an empty line list instead of failing on a region without lines.
    pub lenient: bool,
}

#[derive(Debug, Serialize)]
struct StageReport {
    stage: &'static str,
    dropped: usize,
    instances: Vec<InstanceReport>,
}

#[derive(Debug, Serialize)]
struct InstanceReport {
    bbox: BBoxPx,
    polygon: Vec<[f32; 2]>,
}

/// Runs the command and returns the ordered instances as pretty JSON.
pub fn run(config: Config) -> Result<String> {
    let settings = settings::load_settings(config.settings_path.as_deref())?;
    let image = image::open(&config.image)
        .with_context(|| format!("failed to open image: {}", config.image.display()))?;
    let model = PrecomputedSegmentation::load(&config.predictions)?;

    let (report, overlay) = match config.command {
        Command::Regions => {
            let mut params = settings.region_params();
            if let Some(value) = config.pred_score_threshold {
                params.pred_score_threshold = value;
            }
            if let Some(value) = config.containments_threshold {
                params.containments_threshold = value;
            }
            params.visualize = config.visualize.is_some();
            let inferencer = configured(
                Inferencer::new(model, PrecomputedSegmentation::default()),
                &settings,
            );
            let prediction = inferencer.predict_regions(&image, &params)?;
            let report = StageReport {
                stage: Stage::RegionsOrdered.as_str(),
                dropped: prediction.dropped,
                instances: reports(&prediction.boxes, &prediction.polygons),
            };
            (report, prediction.visualization)
        }
        Command::Lines => {
            let mut params = settings.line_params();
            if let Some(value) = config.pred_score_threshold {
                params.pred_score_threshold = value;
            }
            if let Some(value) = config.containments_threshold {
                params.containments_threshold = value;
            }
            if let Some(value) = config.line_spacing_factor {
                params.line_spacing_factor = value;
            }
            params.visualize = config.visualize.is_some();
            params.strict = params.strict && !config.lenient;
            let inferencer = configured(
                Inferencer::new(PrecomputedSegmentation::default(), model),
                &settings,
            );
            let prediction = inferencer.predict_lines(&image, &params)?;
            let report = StageReport {
                stage: Stage::LinesOrdered.as_str(),
                dropped: prediction.dropped,
                instances: reports(&prediction.boxes, &prediction.polygons),
            };
            (report, prediction.visualization)
        }
    };

    if let (Some(path), Some(overlay)) = (config.visualize.as_deref(), overlay) {
        save_overlay(path, &overlay)?;
    }
    Ok(serde_json::to_string_pretty(&report)?)
}

/// Resolves the transcriber named in settings, if any.
pub fn load_transcriber(
    settings: &Settings,
    registry: &TranscriberRegistry,
) -> Result<Option<LoadedTranscriber>> {
    settings
        .transcriber_model
        .as_deref()
        .map(|model| registry.resolve(model))
        .transpose()
}

fn configured<R, L, T>(inferencer: Inferencer<R, L, T>, settings: &Settings) -> Inferencer<R, L, T> {
    inferencer
        .with_crop_options(settings.crop)
        .with_ordering(settings.ordering)
}

fn reports(boxes: &[BBoxPx], polygons: &[Polygon]) -> Vec<InstanceReport> {
    boxes
        .iter()
        .zip(polygons)
        .map(|(bbox, polygon)| InstanceReport {
            bbox: *bbox,
            polygon: polygon.points.iter().map(|p| [p.x, p.y]).collect(),
        })
        .collect()
}

fn save_overlay(path: &Path, overlay: &image::RgbaImage) -> Result<()> {
    overlay
        .save(path)
        .with_context(|| format!("failed to write visualization: {}", path.display()))?;
    info!("visualization written to {}", path.display());
    Ok(())
}
