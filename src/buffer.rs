//! Activation buffer: refill controller and sampler
//!
//! Streams text through an [`ActivationExtractor`], keeps roughly
//! `n_ctxs * ctx_len` unconsumed activation rows in an [`ActivationStore`],
//! and hands out uniformly sampled batches that are never served twice.
//!
//! ```ignore
//! use actbuf_rs::{ActivationBuffer, BufferConfig, IterTextStream, TapMode};
//!
//! let config = BufferConfig {
//!     point: "layers.3".to_string(),
//!     mode: TapMode::Out,
//!     ..Default::default()
//! };
//! let buffer = ActivationBuffer::new(IterTextStream::new(texts), extractor, config)?;
//! for batch in buffer.take(100) {
//!     let acts = batch?.into_single().expect("single-tap buffer");
//!     // train on acts: (out_batch_size, d)
//! }
//! ```

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::corpus::{TextAdapter, TextStream};
use crate::error::{BufferError, Result};
use crate::masks::select_real_tokens;
use crate::model::ActivationExtractor;
use crate::store::ActivationStore;
use crate::tap::{TapMode, TapSpec};
use crate::tokenize::TokenizedBatch;

/// Configuration for an activation buffer
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Extraction point (module path inside the model)
    pub point: String,
    /// Which side(s) of the extraction point to capture
    pub mode: TapMode,
    /// Input width; inferred from the extraction point when `None`
    pub in_feats: Option<usize>,
    /// Output width; inferred from the extraction point when `None`
    pub out_feats: Option<usize>,
    /// Approximate number of contexts to keep buffered
    pub n_ctxs: usize,
    /// Tokens per context (truncation length)
    pub ctx_len: usize,
    /// Texts per forward pass when refilling
    pub in_batch_size: usize,
    /// Rows per returned batch
    pub out_batch_size: usize,
    /// Device the buffered activations live on
    pub device: Device,
    /// Seed for sampling; entropy when `None`
    pub seed: Option<u64>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            point: "layers.0".to_string(),
            mode: TapMode::Out,
            in_feats: None,
            out_feats: None,
            n_ctxs: 30_000,
            ctx_len: 128,
            in_batch_size: 512,
            out_batch_size: 8192,
            device: Device::Cpu,
            seed: None,
        }
    }
}

impl BufferConfig {
    /// Desired number of unconsumed rows after a refill
    pub fn target_occupancy(&self) -> usize {
        self.n_ctxs * self.ctx_len
    }

    /// Refill when fewer unconsumed rows than this remain.
    ///
    /// Never below 1, so an empty buffer always refills.
    pub fn refill_threshold(&self) -> usize {
        (self.target_occupancy() / 2).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("n_ctxs", self.n_ctxs),
            ("ctx_len", self.ctx_len),
            ("in_batch_size", self.in_batch_size),
            ("out_batch_size", self.out_batch_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(BufferError::config(format!("{name} must be positive")));
            }
        }
        if self.point.is_empty() {
            return Err(BufferError::config("extraction point must be named"));
        }
        Ok(())
    }
}

/// One sampled batch
#[derive(Debug, Clone)]
pub enum Batch {
    /// Single-tap mode: `(n, d)`
    Single(Tensor),
    /// `in_to_out` mode: index-aligned `(n, d_in)` and `(n, d_out)`
    Pair { input: Tensor, output: Tensor },
}

impl Batch {
    /// Number of rows in the batch
    pub fn len(&self) -> usize {
        match self {
            Batch::Single(t) => t.dims()[0],
            Batch::Pair { input, .. } => input.dims()[0],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_single(self) -> Option<Tensor> {
        match self {
            Batch::Single(t) => Some(t),
            Batch::Pair { .. } => None,
        }
    }

    pub fn into_pair(self) -> Option<(Tensor, Tensor)> {
        match self {
            Batch::Pair { input, output } => Some((input, output)),
            Batch::Single(_) => None,
        }
    }
}

/// Why ingestion stopped for good
#[derive(Debug, Clone, Copy)]
enum StreamEnd {
    Exhausted { requested: usize, available: usize },
    Closed,
}

impl StreamEnd {
    fn from_error(err: &BufferError) -> Option<Self> {
        match *err {
            BufferError::Exhausted {
                requested,
                available,
            } => Some(StreamEnd::Exhausted {
                requested,
                available,
            }),
            BufferError::Closed => Some(StreamEnd::Closed),
            _ => None,
        }
    }

    fn to_error(self) -> BufferError {
        match self {
            StreamEnd::Exhausted {
                requested,
                available,
            } => BufferError::exhausted(requested, available),
            StreamEnd::Closed => BufferError::Closed,
        }
    }
}

/// Streaming buffer of activations captured at one extraction point
pub struct ActivationBuffer {
    config: BufferConfig,
    spec: TapSpec,
    adapter: TextAdapter,
    extractor: Box<dyn ActivationExtractor>,
    store: ActivationStore,
    rng: StdRng,
    end: Option<StreamEnd>,
}

impl ActivationBuffer {
    /// Create an empty buffer.
    ///
    /// Feature widths not given in `config` are inferred from the extraction
    /// point; if that is impossible construction fails with a config error.
    pub fn new(
        stream: impl TextStream + 'static,
        extractor: impl ActivationExtractor + 'static,
        config: BufferConfig,
    ) -> Result<Self> {
        Self::from_parts(TextAdapter::new(stream), Box::new(extractor), config)
    }

    pub fn from_parts(
        adapter: TextAdapter,
        extractor: Box<dyn ActivationExtractor>,
        config: BufferConfig,
    ) -> Result<Self> {
        config.validate()?;
        let widths = resolve_widths(extractor.as_ref(), &config)?;

        info!(
            "Activation buffer: point {}, io {}, widths {:?}, target {} rows on {:?}",
            config.point,
            config.mode,
            widths,
            config.target_occupancy(),
            config.device
        );

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let spec = TapSpec {
            point: config.point.clone(),
            mode: config.mode,
            ctx_len: config.ctx_len,
        };
        let store = ActivationStore::new(&widths, config.device.clone());

        Ok(Self {
            config,
            spec,
            adapter,
            extractor,
            store,
            rng,
            end: None,
        })
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Backing store, for inspection
    pub fn store(&self) -> &ActivationStore {
        &self.store
    }

    /// Rows currently held, consumed or not
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Rows not yet handed out
    pub fn unconsumed(&self) -> usize {
        self.store.unconsumed()
    }

    /// True once the text stream has run out or been closed under a refill
    pub fn is_exhausted(&self) -> bool {
        self.end.is_some()
    }

    /// Sample the next batch, refilling first if occupancy is low.
    pub fn next_batch(&mut self) -> Result<Batch> {
        if let Some(end) = self.end {
            return Err(end.to_error());
        }
        if self.store.unconsumed() < self.config.refill_threshold() {
            self.refresh()?;
        }

        let unread = self.store.unconsumed_indices();
        let amount = self.config.out_batch_size.min(unread.len());
        let picks: Vec<u32> = index::sample(&mut self.rng, unread.len(), amount)
            .into_iter()
            .map(|i| unread[i])
            .collect();

        let mut taps = self.store.gather(&picks)?.into_iter();
        self.store.mark_consumed(&picks)?;

        let first = taps
            .next()
            .ok_or_else(|| BufferError::shape_anomaly("store returned no taps"))?;
        Ok(match (self.config.mode, taps.next()) {
            (TapMode::InToOut, Some(output)) => Batch::Pair {
                input: first,
                output,
            },
            (TapMode::InToOut, None) => {
                return Err(BufferError::shape_anomaly("dual-tap store lost its output side"))
            }
            _ => Batch::Single(first),
        })
    }

    /// Drop consumed rows, then ingest text until the target occupancy is reached.
    ///
    /// Running out of text is fatal: the error is returned now and on every
    /// later call.
    pub fn refresh(&mut self) -> Result<()> {
        if let Some(end) = self.end {
            return Err(end.to_error());
        }
        let result = self.refill();
        if let Err(err) = &result {
            if let Some(end) = StreamEnd::from_error(err) {
                warn!("Activation buffer stopped: {err}");
                self.end = Some(end);
            }
        }
        result
    }

    fn refill(&mut self) -> Result<()> {
        let removed = self.store.compact()?;
        debug!(
            "Refreshing buffer: dropped {} consumed rows, {} remain",
            removed,
            self.store.len()
        );

        let target = self.config.target_occupancy();
        while self.store.len() < target {
            let texts = self.adapter.text_batch(self.config.in_batch_size)?;
            let added = self.ingest(&texts)?;
            debug!(
                "Ingested {} texts: +{} rows ({}/{})",
                texts.len(),
                added,
                self.store.len(),
                target
            );
        }

        debug!("Buffer refreshed: {} rows", self.store.len());
        Ok(())
    }

    /// Extract one text batch and append its real-token rows
    fn ingest(&mut self, texts: &[String]) -> Result<usize> {
        let extraction = self.extractor.extract(texts, &self.spec)?;
        let mask = extraction.attention_mask.clone();
        let rows = extraction
            .into_tap_tensors(self.config.mode)?
            .iter()
            .map(|hidden| select_real_tokens(hidden, &mask))
            .collect::<Result<Vec<_>>>()?;
        self.store.append(rows)
    }

    /// Pull raw texts from the stream (`in_batch_size` when `None`)
    pub fn text_batch(&mut self, batch_size: Option<usize>) -> Result<Vec<String>> {
        let n = batch_size.unwrap_or(self.config.in_batch_size);
        self.adapter.text_batch(n)
    }

    /// Pull texts and tokenize them with the buffer's context length.
    ///
    /// `Some(0)` gives an empty `(0, 0)` batch.
    pub fn tokenized_batch(&mut self, batch_size: Option<usize>) -> Result<TokenizedBatch> {
        let texts = self.text_batch(batch_size)?;
        self.extractor.tokenize(&texts, self.config.ctx_len)
    }

    /// Close the underlying text stream
    pub fn close(&mut self) -> Result<()> {
        self.adapter.close()
    }
}

impl Iterator for ActivationBuffer {
    type Item = Result<Batch>;

    /// Ends when the text stream is exhausted or closed.
    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Err(err) if err.is_exhausted() => None,
            other => Some(other),
        }
    }
}

/// Widths for each tap in effect, input side first
fn resolve_widths(
    extractor: &dyn ActivationExtractor,
    config: &BufferConfig,
) -> Result<Vec<usize>> {
    let needs_inference = (config.mode.taps_input() && config.in_feats.is_none())
        || (config.mode.taps_output() && config.out_feats.is_none());
    let exposed = if needs_inference {
        extractor.point_widths(&config.point)?
    } else {
        Default::default()
    };

    let mut widths = Vec::with_capacity(config.mode.n_taps());
    if config.mode.taps_input() {
        let width = config.in_feats.or(exposed.in_features).ok_or_else(|| {
            BufferError::config("in_feats cannot be inferred and must be specified directly")
        })?;
        widths.push(width);
    }
    if config.mode.taps_output() {
        let width = config.out_feats.or(exposed.out_features).ok_or_else(|| {
            BufferError::config("out_feats cannot be inferred and must be specified directly")
        })?;
        widths.push(width);
    }
    Ok(widths)
}
