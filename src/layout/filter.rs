use crate::error::{PipelineError, check_threshold};

use super::RawInstance;

/// Keeps the instances scoring at least `threshold`, preserving their order.
pub fn filter_instances(
    instances: Vec<RawInstance>,
    threshold: f32,
) -> Result<Vec<RawInstance>, PipelineError> {
    let threshold = check_threshold("pred_score_threshold", threshold)?;
    Ok(instances
        .into_iter()
        .filter(|instance| instance.score >= threshold)
        .collect())
}
