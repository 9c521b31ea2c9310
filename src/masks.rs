//! Attention-mask utilities
//!
//! Tokenized batches are padded to a common length. Only positions whose
//! attention mask is non-zero are real tokens; everything here exists to drop
//! the padded positions before activations reach the store.

use candle_core::{DType, Tensor};

use crate::error::{BufferError, Result};

/// Flat `(row * seq_len + col)` indices of the non-zero mask positions.
///
/// `attention_mask` must have shape `(batch, seq_len)`.
pub fn real_token_indices(attention_mask: &Tensor) -> Result<Vec<u32>> {
    if attention_mask.rank() != 2 {
        return Err(BufferError::shape_anomaly(format!(
            "attention mask must be (batch, seq_len), got {:?}",
            attention_mask.dims()
        )));
    }
    let flags: Vec<f32> = attention_mask
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1()?;
    Ok(flags
        .iter()
        .enumerate()
        .filter(|(_, &m)| m != 0.0)
        .map(|(i, _)| i as u32)
        .collect())
}

/// Keep the activations at real-token positions.
///
/// `hidden` is `(batch, seq_len, d)` and `attention_mask` is `(batch, seq_len)`.
/// Returns `(n_real, d)` with rows in batch-major token order.
pub fn select_real_tokens(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, d) = hidden.dims3().map_err(|_| {
        BufferError::shape_anomaly(format!(
            "tapped tensor must be (batch, seq_len, d), got {:?}",
            hidden.dims()
        ))
    })?;
    if attention_mask.dims() != [batch, seq_len] {
        return Err(BufferError::shape_anomaly(format!(
            "attention mask {:?} does not match activations ({batch}, {seq_len})",
            attention_mask.dims()
        )));
    }

    let flat = hidden.reshape((batch * seq_len, d))?;
    let keep = real_token_indices(attention_mask)?;
    if keep.len() == batch * seq_len {
        return Ok(flat);
    }
    if keep.is_empty() {
        return Ok(flat.narrow(0, 0, 0)?);
    }
    let index = Tensor::new(keep.as_slice(), hidden.device())?;
    Ok(flat.index_select(&index, 0)?)
}
