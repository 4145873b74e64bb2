use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SegmentationModel;
use crate::layout::{Mask, Polygon, RawInstance};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecomputedInstance {
    pub score: f32,
    pub polygon: Vec<[f32; 2]>,
}

/// Stored model output. `width`/`height` give the frame the polygons were drawn in;
/// zero means the frame of whatever image is passed to `predict`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrecomputedPage {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub instances: Vec<PrecomputedInstance>,
}

/// Replays saved predictions instead of running a network.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedSegmentation {
    page: PrecomputedPage,
}

impl PrecomputedSegmentation {
    pub fn new(page: PrecomputedPage) -> Self {
        Self { page }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let page: PrecomputedPage =
            serde_json::from_str(content).context("failed to parse predictions")?;
        Ok(Self::new(page))
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("predictions file not found: {}", path.display()));
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read predictions: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("invalid predictions file: {}", path.display()))
    }

    pub fn page(&self) -> &PrecomputedPage {
        &self.page
    }
}

impl SegmentationModel for PrecomputedSegmentation {
    fn predict(&self, image: &DynamicImage) -> Result<Vec<RawInstance>> {
        let (width, height) = if self.page.width == 0 || self.page.height == 0 {
            image.dimensions()
        } else {
            (self.page.width, self.page.height)
        };
        let instances: Vec<RawInstance> = self
            .page
            .instances
            .iter()
            .map(|instance| {
                let polygon = Polygon::from_pairs(&instance.polygon);
                RawInstance::new(Mask::from_polygon(&polygon, width, height), instance.score)
            })
            .collect();
        debug!(
            "replayed {} instances in a {}x{} frame",
            instances.len(),
            width,
            height
        );
        Ok(instances)
    }
}
