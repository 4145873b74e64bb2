use anyhow::Result;
use image::{DynamicImage, GrayImage, Luma};

use super::Preprocessor;

/// Grayscale, contrast stretch, then a global threshold.
///
/// Transparent pixels are composited over white first. The output keeps the input
/// size so masks predicted on it line up with the original page.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Binarizer {
    /// Cut-off as a fraction of full intensity, applied after stretching.
    pub threshold: f32,
}

impl Default for Binarizer {
    fn default() -> Self {
        Self { threshold: 0.65 }
    }
}

impl Preprocessor for Binarizer {
    fn binarize(&self, image: &DynamicImage) -> Result<DynamicImage> {
        let luma = to_luma_over_white(image);
        let stretched = contrast_stretch(&luma);
        let cutoff = (self.threshold.clamp(0.0, 1.0) * 255.0) as u8;
        Ok(DynamicImage::ImageLuma8(threshold(&stretched, cutoff)))
    }
}

fn to_luma_over_white(image: &DynamicImage) -> GrayImage {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut luma = GrayImage::new(width, height);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as f32 / 255.0;
        let over = |c: u8| c as f32 * alpha + 255.0 * (1.0 - alpha);
        let value = (0.299 * over(r) + 0.587 * over(g) + 0.114 * over(b)).round();
        luma.put_pixel(x, y, Luma([value.clamp(0.0, 255.0) as u8]));
    }
    luma
}

fn contrast_stretch(image: &GrayImage) -> GrayImage {
    let (min, max) = image
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if max <= min {
        return image.clone();
    }
    let scale = 255.0 / (max - min) as f32;
    let mut output = image.clone();
    for pixel in output.pixels_mut() {
        pixel[0] = ((pixel[0] - min) as f32 * scale).round() as u8;
    }
    output
}

fn threshold(image: &GrayImage, cutoff: u8) -> GrayImage {
    let mut output = image.clone();
    for pixel in output.pixels_mut() {
        pixel[0] = if pixel[0] > cutoff { 255 } else { 0 };
    }
    output
}
