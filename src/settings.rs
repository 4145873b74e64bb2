use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::layout::{CropOptions, MarginaliaConfig};
use crate::pipeline::{LineParams, PageParams, RegionParams};

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub region: RegionParams,
    pub line: LineParams,
    pub ordering: MarginaliaConfig,
    pub crop: CropOptions,
    pub workers: usize,
    pub strict_lines: bool,
    pub transcriber_model: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            region: RegionParams::default(),
            line: LineParams::default(),
            ordering: MarginaliaConfig::default(),
            crop: CropOptions::default(),
            workers: 0,
            strict_lines: false,
            transcriber_model: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    region: Option<RegionSettings>,
    line: Option<LineSettings>,
    ordering: Option<OrderingSettings>,
    crop: Option<CropSettings>,
    pipeline: Option<PipelineSettings>,
    transcriber: Option<TranscriberSettings>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegionSettings {
    pred_score_threshold: Option<f32>,
    containments_threshold: Option<f32>,
    visualize: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LineSettings {
    pred_score_threshold: Option<f32>,
    containments_threshold: Option<f32>,
    line_spacing_factor: Option<f32>,
    visualize: Option<bool>,
    strict: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OrderingSettings {
    column_gap_ratio: Option<f32>,
    main_column_min_share: Option<f32>,
    marginalia_min_area_ratio: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CropSettings {
    polygon_epsilon: Option<f64>,
    fill_outside_mask: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineSettings {
    workers: Option<usize>,
    strict_lines: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TranscriberSettings {
    model: Option<String>,
}

/// Loads settings layered over the built-in defaults, looking for `htr.toml` and
/// `htr.local.toml` in the working directory.
pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    load_settings_from(Path::new("."), extra_path)
}

pub fn load_settings_from(base_dir: &Path, extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    settings.apply(DEFAULT_SETTINGS_TOML, Path::new("<built-in settings>"))?;

    let mut ordered_paths: Vec<PathBuf> =
        vec![base_dir.join("htr.toml"), base_dir.join("htr.local.toml")];
    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings.apply(&content, &path)?;
        }
    }
    Ok(settings)
}

fn parse(content: &str, path: &Path) -> Result<SettingsFile> {
    toml::from_str(content).with_context(|| format!("failed to parse settings: {}", path.display()))
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(anyhow!("{} must be between 0 and 1, got {}", name, value))
    }
}

impl Settings {
    pub fn region_params(&self) -> RegionParams {
        self.region
    }

    pub fn line_params(&self) -> LineParams {
        self.line
    }

    pub fn page_params(&self) -> PageParams {
        PageParams {
            regions: self.region,
            lines: LineParams {
                strict: self.strict_lines,
                ..self.line
            },
            workers: self.workers,
        }
    }

    fn apply(&mut self, content: &str, path: &Path) -> Result<()> {
        self.merge(parse(content, path)?);
        self.validate()
            .with_context(|| format!("invalid settings: {}", path.display()))
    }

    /// Range checks for values no pipeline call validates on its own.
    fn validate(&self) -> Result<()> {
        check_unit("ordering.column_gap_ratio", self.ordering.column_gap_ratio)?;
        check_unit("ordering.main_column_min_share", self.ordering.main_column_min_share)?;
        check_unit(
            "ordering.marginalia_min_area_ratio",
            self.ordering.marginalia_min_area_ratio,
        )?;
        let epsilon = self.crop.polygon_epsilon;
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(anyhow!(
                "crop.polygon_epsilon must be a non-negative number, got {}",
                epsilon
            ));
        }
        Ok(())
    }

    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(region) = incoming.region {
            if let Some(value) = region.pred_score_threshold {
                self.region.pred_score_threshold = value;
            }
            if let Some(value) = region.containments_threshold {
                self.region.containments_threshold = value;
            }
            if let Some(value) = region.visualize {
                self.region.visualize = value;
            }
        }
        if let Some(line) = incoming.line {
            if let Some(value) = line.pred_score_threshold {
                self.line.pred_score_threshold = value;
            }
            if let Some(value) = line.containments_threshold {
                self.line.containments_threshold = value;
            }
            if let Some(value) = line.line_spacing_factor {
                self.line.line_spacing_factor = value;
            }
            if let Some(value) = line.visualize {
                self.line.visualize = value;
            }
            if let Some(value) = line.strict {
                self.line.strict = value;
            }
        }
        if let Some(ordering) = incoming.ordering {
            if let Some(value) = ordering.column_gap_ratio {
                self.ordering.column_gap_ratio = value;
            }
            if let Some(value) = ordering.main_column_min_share {
                self.ordering.main_column_min_share = value;
            }
            if let Some(value) = ordering.marginalia_min_area_ratio {
                self.ordering.marginalia_min_area_ratio = value;
            }
        }
        if let Some(crop) = incoming.crop {
            if let Some(value) = crop.polygon_epsilon {
                self.crop.polygon_epsilon = value;
            }
            if let Some(value) = crop.fill_outside_mask {
                self.crop.fill_outside_mask = value;
            }
        }
        if let Some(pipeline) = incoming.pipeline {
            if let Some(workers) = pipeline.workers {
                self.workers = workers;
            }
            if let Some(strict) = pipeline.strict_lines {
                self.strict_lines = strict;
            }
        }
        if let Some(transcriber) = incoming.transcriber {
            if let Some(model) = transcriber.model {
                let model = model.trim();
                self.transcriber_model = if model.is_empty() {
                    None
                } else {
                    Some(model.to_string())
                };
            }
        }
    }
}
