use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use image::DynamicImage;
use tracing::info;

use super::{Preprocessor, Transcription, TranscriptionModel};

pub type TranscriberLoader =
    Arc<dyn Fn(&str) -> Result<Box<dyn TranscriptionModel>> + Send + Sync>;

/// How to build one family of transcription models and prepare their input.
#[derive(Clone)]
pub struct TranscriberStrategy {
    preprocessor: Option<Arc<dyn Preprocessor>>,
    loader: TranscriberLoader,
}

impl TranscriberStrategy {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&str) -> Result<Box<dyn TranscriptionModel>> + Send + Sync + 'static,
    {
        Self {
            preprocessor: None,
            loader: Arc::new(loader),
        }
    }

    pub fn with_preprocessor<P: Preprocessor + 'static>(mut self, preprocessor: P) -> Self {
        self.preprocessor = Some(Arc::new(preprocessor));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriberSelection {
    pub strategy: Option<String>,
    pub model: String,
}

/// Parses `strategy:model` or a bare model identifier.
pub fn parse_transcriber_arg(raw: &str) -> Result<TranscriberSelection> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow!("transcriber model is empty"));
    }
    if let Some((strategy, model)) = raw.split_once(':') {
        let strategy = strategy.trim().to_lowercase();
        let model = model.trim();
        if strategy.is_empty() {
            return Err(anyhow!("missing strategy name in '{}'", raw));
        }
        if model.is_empty() {
            return Err(anyhow!("missing model name in '{}'", raw));
        }
        return Ok(TranscriberSelection {
            strategy: Some(strategy),
            model: model.to_string(),
        });
    }
    Ok(TranscriberSelection {
        strategy: None,
        model: raw.to_string(),
    })
}

/// Maps model identifiers to strategies. Resolve once, then reuse the result.
#[derive(Clone, Default)]
pub struct TranscriberRegistry {
    strategies: HashMap<String, TranscriberStrategy>,
    default: Option<String>,
}

impl TranscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, id: &str, strategy: TranscriberStrategy) -> Self {
        self.strategies.insert(id.trim().to_lowercase(), strategy);
        self
    }

    /// Strategy used for bare identifiers that name no registered strategy.
    pub fn with_default(mut self, id: &str) -> Self {
        self.default = Some(id.trim().to_lowercase());
        self
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn resolve(&self, model_arg: &str) -> Result<LoadedTranscriber> {
        let selection = parse_transcriber_arg(model_arg)?;
        let key = match &selection.strategy {
            Some(strategy) => strategy.clone(),
            None => {
                let bare = selection.model.to_lowercase();
                if self.strategies.contains_key(&bare) {
                    bare
                } else {
                    self.default.clone().ok_or_else(|| {
                        anyhow!(
                            "no strategy for transcriber '{}' and no default registered",
                            selection.model
                        )
                    })?
                }
            }
        };
        let strategy = self.strategies.get(&key).ok_or_else(|| {
            anyhow!(
                "unknown transcriber strategy '{}' (available: {})",
                key,
                self.ids().join(", ")
            )
        })?;
        let model = (strategy.loader)(&selection.model)
            .with_context(|| format!("failed to load transcriber '{}'", selection.model))?;
        info!(
            "transcriber '{}' loaded with strategy '{}'",
            selection.model, key
        );
        Ok(LoadedTranscriber {
            model_id: selection.model,
            strategy: key,
            preprocessor: strategy.preprocessor.clone(),
            model,
        })
    }
}

/// A transcription model bundled with the preprocessing its strategy asks for.
pub struct LoadedTranscriber {
    model_id: String,
    strategy: String,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    model: Box<dyn TranscriptionModel>,
}

impl LoadedTranscriber {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }
}

impl TranscriptionModel for LoadedTranscriber {
    fn transcribe(&self, line: &DynamicImage) -> Result<Transcription> {
        let input = match &self.preprocessor {
            Some(preprocessor) => Cow::Owned(preprocessor.binarize(line)?),
            None => Cow::Borrowed(line),
        };
        self.model.transcribe(&input)
    }
}
