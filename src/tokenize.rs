//! Fixed-length batch tokenization
//!
//! Texts are encoded one by one, truncated to `ctx_len` tokens and
//! right-padded to the longest row of the batch. The attention mask marks
//! real tokens with 1 and padding with 0.

use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use crate::error::{BufferError, Result};

/// A padded batch of token ids with its attention mask
#[derive(Debug, Clone)]
pub struct TokenizedBatch {
    /// Shape `(batch, seq_len)`, dtype u32
    pub input_ids: Tensor,
    /// Shape `(batch, seq_len)`, dtype u32, 1 = real token
    pub attention_mask: Tensor,
}

impl TokenizedBatch {
    /// Build a batch from per-text token ids.
    ///
    /// Each row is truncated to `ctx_len` and padded with `pad_id` up to the
    /// longest (truncated) row. No rows gives a `(0, 0)` batch.
    pub fn from_token_ids(
        rows: Vec<Vec<u32>>,
        ctx_len: usize,
        pad_id: u32,
        device: &Device,
    ) -> Result<Self> {
        if ctx_len == 0 {
            return Err(BufferError::config("ctx_len must be positive"));
        }

        let seq_len = rows.iter().map(|r| r.len().min(ctx_len)).max().unwrap_or(0);
        let batch = rows.len();
        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for row in &rows {
            let real = row.len().min(ctx_len);
            ids.extend_from_slice(&row[..real]);
            mask.extend(std::iter::repeat(1u32).take(real));
            ids.extend(std::iter::repeat(pad_id).take(seq_len - real));
            mask.extend(std::iter::repeat(0u32).take(seq_len - real));
        }

        Ok(Self {
            input_ids: Tensor::from_vec(ids, (batch, seq_len), device)?,
            attention_mask: Tensor::from_vec(mask, (batch, seq_len), device)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.dims()[0]
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims()[1]
    }

    /// Count of non-padding positions
    pub fn n_real_tokens(&self) -> Result<usize> {
        let total: u32 = self.attention_mask.sum_all()?.to_scalar()?;
        Ok(total as usize)
    }
}

/// Anything that can turn text into token ids
pub trait BatchTokenizer {
    /// Token ids for one text, before truncation
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>>;

    /// Id used for padding positions
    fn pad_id(&self) -> u32 {
        0
    }

    /// Tokenize a batch with truncation to `ctx_len` and padding to the longest row.
    fn tokenize_batch(
        &self,
        texts: &[String],
        ctx_len: usize,
        device: &Device,
    ) -> Result<TokenizedBatch> {
        let rows = texts
            .iter()
            .map(|t| self.encode_ids(t))
            .collect::<Result<Vec<_>>>()?;
        TokenizedBatch::from_token_ids(rows, ctx_len, self.pad_id(), device)
    }
}

impl BatchTokenizer for Tokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .encode(text, true)
            .map_err(|e| BufferError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn pad_id(&self) -> u32 {
        // Configured padding wins, then common pad tokens
        self.get_padding()
            .map(|p| p.pad_id)
            .or_else(|| self.token_to_id("<pad>"))
            .or_else(|| self.token_to_id("[PAD]"))
            .or_else(|| self.token_to_id("<|endoftext|>"))
            .unwrap_or(0)
    }
}
