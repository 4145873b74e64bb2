use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use image::{DynamicImage, GenericImageView, GrayImage, Luma, Rgb, RgbImage};

use crate::layout::{Mask, RawInstance};
use crate::models::{Preprocessor, SegmentationModel, Transcription, TranscriptionModel};

pub(crate) fn rect_mask(frame_w: u32, frame_h: u32, x: u32, y: u32, w: u32, h: u32) -> Mask {
    let mut bitmap = GrayImage::new(frame_w, frame_h);
    for py in y..(y + h).min(frame_h) {
        for px in x..(x + w).min(frame_w) {
            bitmap.put_pixel(px, py, Luma([255]));
        }
    }
    Mask::from_bitmap(&bitmap)
}

pub(crate) fn scored_rect(
    frame_w: u32,
    frame_h: u32,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    score: f32,
) -> RawInstance {
    RawInstance::new(rect_mask(frame_w, frame_h, x, y, w, h), score)
}

/// Never contains pure white, so masked-out fill is detectable.
pub(crate) fn gradient_image(w: u32, h: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
        Rgb([(x % 200) as u8, (y % 200) as u8, 64])
    }))
}

/// `count` full-width horizontal stripes spread over the image frame.
pub(crate) fn stripes(image: &DynamicImage, count: u32) -> Vec<RawInstance> {
    let (w, h) = image.dimensions();
    let step = h / (2 * count + 1).max(1);
    (0..count)
        .map(|i| scored_rect(w, h, w / 10, (2 * i + 1) * step, w - w / 5, step, 0.9))
        .collect()
}

pub(crate) struct FnSegmentation<F> {
    predict: F,
    calls: AtomicUsize,
}

impl<F> FnSegmentation<F>
where
    F: Fn(&DynamicImage) -> Result<Vec<RawInstance>> + Send + Sync,
{
    pub(crate) fn new(predict: F) -> Self {
        Self {
            predict,
            calls: AtomicUsize::new(0),
        }
    }
}

impl<F> FnSegmentation<F> {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<F> SegmentationModel for FnSegmentation<F>
where
    F: Fn(&DynamicImage) -> Result<Vec<RawInstance>> + Send + Sync,
{
    fn predict(&self, image: &DynamicImage) -> Result<Vec<RawInstance>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.predict)(image)
    }
}

pub(crate) fn fixed_segmentation(
    instances: Vec<RawInstance>,
) -> FnSegmentation<impl Fn(&DynamicImage) -> Result<Vec<RawInstance>> + Send + Sync> {
    FnSegmentation::new(move |_: &DynamicImage| Ok(instances.clone()))
}

/// Reports the crop size as text with a long confidence.
pub(crate) struct SizeTranscriber;

impl TranscriptionModel for SizeTranscriber {
    fn transcribe(&self, line: &DynamicImage) -> Result<Transcription> {
        let (w, h) = line.dimensions();
        Ok(Transcription {
            text: format!("{}x{}", w, h),
            confidence: 0.876_54,
        })
    }
}

pub(crate) struct IdentityPreprocessor;

impl Preprocessor for IdentityPreprocessor {
    fn binarize(&self, image: &DynamicImage) -> Result<DynamicImage> {
        Ok(image.clone())
    }
}
