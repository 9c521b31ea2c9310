// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::similar_names)] // related variables like `input`/`inputs`
#![allow(clippy::module_name_repetitions)] // ActivationStore in store.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! actbuf-rs: streaming activation buffer
//!
//! Streams raw text through a model, captures the activations at one
//! internal extraction point, and serves them as uniformly sampled batches
//! that are never handed out twice.
//!
//! ## Architecture
//!
//! - `buffer`: ActivationBuffer (refill controller + sampler + iterator) and BufferConfig
//! - `store`: ActivationStore arena of activation rows with a shared consumed set
//! - `corpus`: TextStream sources (in-memory, JSONL) and the batching TextAdapter
//! - `tokenize`: fixed-length batch tokenization with attention masks
//! - `model`: TapModel / ActivationExtractor seams to the model
//! - `linear_stack`: LinearStack, a small candle model with tappable layers
//! - `masks`: attention-mask filtering of padded positions
//! - `tap`: tap modes, tapped values and extraction results
//! - `error`: BufferError taxonomy

pub mod buffer;
pub mod corpus;
pub mod error;
pub mod linear_stack;
pub mod masks;
pub mod model;
pub mod store;
pub mod tap;
pub mod tokenize;

pub use buffer::{ActivationBuffer, Batch, BufferConfig};
pub use corpus::{IterTextStream, JsonlTextStream, TextAdapter, TextStream};
pub use error::{BufferError, Result};
pub use linear_stack::{LinearStack, LinearStackConfig};
pub use masks::{real_token_indices, select_real_tokens};
pub use model::{ActivationExtractor, TapModel, Taps, TokenizedExtractor};
pub use store::ActivationStore;
pub use tap::{Extraction, PointWidths, TapMode, TapSpec, Tapped};
pub use tokenize::{BatchTokenizer, TokenizedBatch};
