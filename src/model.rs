//! Model seams for activation extraction
//!
//! The buffer only ever talks to an [`ActivationExtractor`]: texts in, raw
//! tapped values plus the attention mask out. [`TokenizedExtractor`] builds
//! one from a tokenizer and a [`TapModel`], which is the only thing a new
//! model has to implement.

use candle_core::Device;

use crate::error::Result;
use crate::tap::{Extraction, PointWidths, TapMode, TapSpec, Tapped};
use crate::tokenize::{BatchTokenizer, TokenizedBatch};

/// Values read at an extraction point during one forward pass
#[derive(Debug, Clone, Default)]
pub struct Taps {
    pub input: Option<Tapped>,
    pub output: Option<Tapped>,
}

/// A model that can expose the input/output of a named internal module.
pub trait TapModel {
    /// Device the model runs on
    fn device(&self) -> &Device;

    /// Widths of the extraction point, where the point exposes them.
    ///
    /// Unknown points are a configuration error.
    fn point_widths(&self, point: &str) -> Result<PointWidths>;

    /// Run the forward pass far enough to read the requested taps.
    fn forward_tapped(&self, batch: &TokenizedBatch, point: &str, mode: TapMode) -> Result<Taps>;
}

/// Capability consumed by the activation buffer
pub trait ActivationExtractor {
    /// Widths of the extraction point, where the point exposes them
    fn point_widths(&self, point: &str) -> Result<PointWidths>;

    /// Fixed-length tokenization with truncation to `ctx_len`
    fn tokenize(&self, texts: &[String], ctx_len: usize) -> Result<TokenizedBatch>;

    /// Tokenize, run the model and return the raw taps with the attention mask
    fn extract(&self, texts: &[String], spec: &TapSpec) -> Result<Extraction>;
}

/// Extractor made of a tokenizer and a tappable model
pub struct TokenizedExtractor<T, M> {
    tokenizer: T,
    model: M,
}

impl<T: BatchTokenizer, M: TapModel> TokenizedExtractor<T, M> {
    pub fn new(tokenizer: T, model: M) -> Self {
        Self { tokenizer, model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }
}

impl<T: BatchTokenizer, M: TapModel> ActivationExtractor for TokenizedExtractor<T, M> {
    fn point_widths(&self, point: &str) -> Result<PointWidths> {
        self.model.point_widths(point)
    }

    fn tokenize(&self, texts: &[String], ctx_len: usize) -> Result<TokenizedBatch> {
        self.tokenizer
            .tokenize_batch(texts, ctx_len, self.model.device())
    }

    fn extract(&self, texts: &[String], spec: &TapSpec) -> Result<Extraction> {
        let batch = self.tokenize(texts, spec.ctx_len)?;
        let taps = self.model.forward_tapped(&batch, &spec.point, spec.mode)?;
        Ok(Extraction {
            input: taps.input,
            output: taps.output,
            attention_mask: batch.attention_mask,
        })
    }
}
