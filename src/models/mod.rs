use anyhow::Result;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::layout::{Alignment, RawInstance};

mod precomputed;
mod preprocess;
mod registry;

pub use precomputed::{PrecomputedInstance, PrecomputedPage, PrecomputedSegmentation};
pub use preprocess::Binarizer;
pub use registry::{
    LoadedTranscriber, TranscriberLoader, TranscriberRegistry, TranscriberStrategy,
    TranscriberSelection, parse_transcriber_arg,
};

/// Instance segmentation backend for either page regions or text lines.
///
/// Zero instances is a valid answer. Masks may live in a working frame of any size;
/// the pipeline maps them back onto the image that was passed in.
pub trait SegmentationModel: Send + Sync {
    fn predict(&self, image: &DynamicImage) -> Result<Vec<RawInstance>>;

    /// How the working frame maps onto an image of the given size. `None` stretches
    /// each mask frame over the whole image.
    fn alignment(&self, _image_width: u32, _image_height: u32) -> Option<Alignment> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
}

pub trait TranscriptionModel: Send + Sync {
    fn transcribe(&self, line: &DynamicImage) -> Result<Transcription>;
}

/// Image cleanup applied before a model sees the pixels.
pub trait Preprocessor: Send + Sync {
    fn binarize(&self, image: &DynamicImage) -> Result<DynamicImage>;
}

impl<T: SegmentationModel + ?Sized> SegmentationModel for Box<T> {
    fn predict(&self, image: &DynamicImage) -> Result<Vec<RawInstance>> {
        (**self).predict(image)
    }

    fn alignment(&self, image_width: u32, image_height: u32) -> Option<Alignment> {
        (**self).alignment(image_width, image_height)
    }
}

impl<T: TranscriptionModel + ?Sized> TranscriptionModel for Box<T> {
    fn transcribe(&self, line: &DynamicImage) -> Result<Transcription> {
        (**self).transcribe(line)
    }
}
