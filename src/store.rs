//! Activation store: an arena of activation rows with a consumed set
//!
//! One store serves every tap in effect. In `in_to_out` mode it holds two
//! index-aligned tensors that share a single consumed-flag vector, so append,
//! compaction and marking always act on both sides in one step and row `i`
//! of each tap refers to the same source token.

use candle_core::{DType, Device, Tensor};

use crate::error::{BufferError, Result};

/// Buffered activation rows plus their consumed flags
#[derive(Debug)]
pub struct ActivationStore {
    /// Feature width per tap
    widths: Vec<usize>,
    /// Rows per tap, shape `(len, width)`; `None` while empty
    rows: Vec<Option<Tensor>>,
    /// One flag per row, shared across taps
    consumed: Vec<bool>,
    /// Count of false entries in `consumed`
    n_unconsumed: usize,
    device: Device,
}

impl ActivationStore {
    /// Create an empty store with one tap per entry in `widths`.
    pub fn new(widths: &[usize], device: Device) -> Self {
        Self {
            widths: widths.to_vec(),
            rows: vec![None; widths.len()],
            consumed: Vec::new(),
            n_unconsumed: 0,
            device,
        }
    }

    /// Number of parallel taps
    pub fn n_taps(&self) -> usize {
        self.widths.len()
    }

    /// Feature width of each tap
    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Total rows held, consumed or not
    pub fn len(&self) -> usize {
        self.consumed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty()
    }

    /// Number of rows not yet handed out
    pub fn unconsumed(&self) -> usize {
        self.n_unconsumed
    }

    /// Positions of the rows not yet handed out, ascending
    pub fn unconsumed_indices(&self) -> Vec<u32> {
        self.consumed
            .iter()
            .enumerate()
            .filter(|(_, &c)| !c)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Consumed flag at `index`, `None` if out of range
    pub fn is_consumed(&self, index: usize) -> Option<bool> {
        self.consumed.get(index).copied()
    }

    /// Append freshly extracted rows, one tensor per tap.
    ///
    /// Every tensor must be `(n, width)` with the same `n`. Rows land on the
    /// store's device as `f32` with their consumed flags set to false.
    /// Nothing is written unless every tap validates.
    pub fn append(&mut self, taps: Vec<Tensor>) -> Result<usize> {
        if taps.len() != self.n_taps() {
            return Err(BufferError::shape_anomaly(format!(
                "expected {} tapped tensors, got {}",
                self.n_taps(),
                taps.len()
            )));
        }

        let mut n_new = None;
        for (tensor, &width) in taps.iter().zip(&self.widths) {
            let (n, d) = tensor.dims2().map_err(|_| {
                BufferError::shape_anomaly(format!(
                    "activation rows must be (n, d), got {:?}",
                    tensor.dims()
                ))
            })?;
            if d != width {
                return Err(BufferError::shape_anomaly(format!(
                    "activation width {d} does not match configured width {width}"
                )));
            }
            match n_new {
                None => n_new = Some(n),
                Some(expected) if expected != n => {
                    return Err(BufferError::shape_anomaly(format!(
                        "tapped tensors disagree on row count ({expected} vs {n})"
                    )));
                }
                Some(_) => {}
            }
        }
        let n_new = n_new.unwrap_or(0);
        if n_new == 0 {
            return Ok(0);
        }

        let mut grown = Vec::with_capacity(taps.len());
        for (tensor, existing) in taps.into_iter().zip(&self.rows) {
            let tensor = tensor.to_device(&self.device)?.to_dtype(DType::F32)?;
            let merged = match existing {
                Some(existing) => Tensor::cat(&[existing, &tensor], 0)?,
                None => tensor,
            };
            grown.push(Some(merged));
        }
        self.rows = grown;
        self.consumed.resize(self.consumed.len() + n_new, false);
        self.n_unconsumed += n_new;
        Ok(n_new)
    }

    /// Drop consumed rows, keeping the rest in their relative order.
    ///
    /// Returns the number of rows removed.
    pub fn compact(&mut self) -> Result<usize> {
        let removed = self.len() - self.n_unconsumed;
        if removed == 0 {
            return Ok(0);
        }

        let keep = self.unconsumed_indices();
        if keep.is_empty() {
            self.rows = vec![None; self.n_taps()];
        } else {
            let index = Tensor::new(keep.as_slice(), &self.device)?;
            let mut kept = Vec::with_capacity(self.n_taps());
            for rows in &self.rows {
                kept.push(match rows {
                    Some(rows) => Some(rows.index_select(&index, 0)?),
                    None => None,
                });
            }
            self.rows = kept;
        }
        self.consumed = vec![false; keep.len()];
        Ok(removed)
    }

    /// Flag rows as consumed. Marking an already consumed row is a no-op.
    pub fn mark_consumed(&mut self, indices: &[u32]) -> Result<()> {
        let len = self.len();
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= len) {
            return Err(BufferError::shape_anomaly(format!(
                "row index {bad} out of range for store of {len}"
            )));
        }
        for &i in indices {
            let flag = &mut self.consumed[i as usize];
            if !*flag {
                *flag = true;
                self.n_unconsumed -= 1;
            }
        }
        Ok(())
    }

    /// Rows at `indices` for every tap, in the order given.
    pub fn gather(&self, indices: &[u32]) -> Result<Vec<Tensor>> {
        let len = self.len();
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= len) {
            return Err(BufferError::shape_anomaly(format!(
                "row index {bad} out of range for store of {len}"
            )));
        }

        let mut out = Vec::with_capacity(self.n_taps());
        if indices.is_empty() {
            for &width in &self.widths {
                out.push(Tensor::zeros((0, width), DType::F32, &self.device)?);
            }
            return Ok(out);
        }

        let index = Tensor::new(indices, &self.device)?;
        for rows in self.rows.iter().flatten() {
            out.push(rows.index_select(&index, 0)?);
        }
        Ok(out)
    }
}
