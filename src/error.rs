//! Typed failures of the page pipeline.

use std::fmt;

use thiserror::Error;

/// States of the per-page state machine, used to locate failures and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    RegionsPredicted,
    RegionsFiltered,
    RegionsClean,
    RegionsOrdered,
    LinesPredicted,
    LinesFiltered,
    LinesClean,
    LinesOrdered,
    Transcribed,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::RegionsPredicted => "regions-predicted",
            Stage::RegionsFiltered => "regions-filtered",
            Stage::RegionsClean => "regions-clean",
            Stage::RegionsOrdered => "regions-ordered",
            Stage::LinesPredicted => "lines-predicted",
            Stage::LinesFiltered => "lines-filtered",
            Stage::LinesClean => "lines-clean",
            Stage::LinesOrdered => "lines-ordered",
            Stage::Transcribed => "transcribed",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A threshold parameter fell outside `[0, 1]`.
    #[error("threshold '{name}' must be within [0, 1], got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error("no regions were detected on the page")]
    NoRegionsDetected,

    #[error("no lines were detected{}", region_suffix(.region))]
    NoLinesDetected { region: Option<usize> },

    /// A segmentation, transcription or preprocessing collaborator failed.
    #[error("model call failed at stage {stage}{}", region_suffix(.region))]
    Model {
        stage: Stage,
        region: Option<usize>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A non-threshold tuning parameter was negative or not finite.
    #[error("parameter '{name}' must be a finite non-negative number, got {value}")]
    InvalidParameter { name: &'static str, value: f32 },

    #[error("failed to start the region worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl PipelineError {
    pub(crate) fn model(stage: Stage, region: Option<usize>, err: anyhow::Error) -> Self {
        PipelineError::Model {
            stage,
            region,
            source: err.into(),
        }
    }

    /// Whether a caller may reasonably retry with relaxed thresholds.
    pub fn is_empty_detection(&self) -> bool {
        matches!(
            self,
            PipelineError::NoRegionsDetected | PipelineError::NoLinesDetected { .. }
        )
    }
}

fn region_suffix(region: &Option<usize>) -> String {
    match region {
        Some(index) => format!(" in region {}", index),
        None => String::new(),
    }
}

/// Validates that a threshold lies within `[0, 1]`; NaN is rejected.
pub fn check_threshold(name: &'static str, value: f32) -> Result<f32, PipelineError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(PipelineError::InvalidThreshold { name, value })
    }
}

pub fn check_factor(name: &'static str, value: f32) -> Result<f32, PipelineError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(PipelineError::InvalidParameter { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_outside_unit_interval_are_rejected() {
        assert!(check_threshold("t", 0.0).is_ok());
        assert!(check_threshold("t", 1.0).is_ok());
        for bad in [1.5, -0.1, f32::NAN] {
            let err = check_threshold("pred_score_threshold", bad).unwrap_err();
            assert!(matches!(
                err,
                PipelineError::InvalidThreshold {
                    name: "pred_score_threshold",
                    ..
                }
            ));
        }
    }

    #[test]
    fn factors_must_be_finite_and_non_negative() {
        assert_eq!(check_factor("line_spacing_factor", 1.5).ok(), Some(1.5));
        for bad in [-0.5, f32::INFINITY, f32::NAN] {
            assert!(matches!(
                check_factor("line_spacing_factor", bad),
                Err(PipelineError::InvalidParameter { .. })
            ));
        }
    }

    #[test]
    fn messages_name_the_region() {
        let err = PipelineError::NoLinesDetected { region: Some(3) };
        assert_eq!(err.to_string(), "no lines were detected in region 3");
        let err = PipelineError::NoLinesDetected { region: None };
        assert_eq!(err.to_string(), "no lines were detected");
        assert!(err.is_empty_detection());
    }

    #[test]
    fn model_errors_keep_their_source() {
        let err = PipelineError::model(Stage::LinesPredicted, Some(1), anyhow::anyhow!("boom"));
        assert_eq!(
            err.to_string(),
            "model call failed at stage lines-predicted in region 1"
        );
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "boom");
    }
}
