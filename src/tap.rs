//! Tap descriptions: which tensors at an extraction point are captured
//!
//! An extraction point is named by a module path (e.g. `"layers.3"`). A tap
//! reads its input, its output, or both. Model internals do not always hand
//! back a bare tensor (transformer blocks often return `(hidden, extras..)`),
//! so tapped values are modelled as [`Tapped`] and unwrapped to the first
//! element until a tensor is reached.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{BufferError, Result};

/// Which tensor(s) at the extraction point are captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapMode {
    /// Input tensor of the extraction point
    In,
    /// Output tensor of the extraction point
    #[default]
    Out,
    /// Both, kept index-aligned
    InToOut,
}

impl TapMode {
    /// Whether the input side is captured
    pub fn taps_input(self) -> bool {
        matches!(self, TapMode::In | TapMode::InToOut)
    }

    /// Whether the output side is captured
    pub fn taps_output(self) -> bool {
        matches!(self, TapMode::Out | TapMode::InToOut)
    }

    /// Number of parallel buffers this mode needs
    pub fn n_taps(self) -> usize {
        match self {
            TapMode::In | TapMode::Out => 1,
            TapMode::InToOut => 2,
        }
    }
}

impl fmt::Display for TapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TapMode::In => "in",
            TapMode::Out => "out",
            TapMode::InToOut => "in_to_out",
        };
        f.write_str(s)
    }
}

impl FromStr for TapMode {
    type Err = BufferError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in" => Ok(TapMode::In),
            "out" => Ok(TapMode::Out),
            "in_to_out" => Ok(TapMode::InToOut),
            other => Err(BufferError::config(format!(
                "io must be one of 'in', 'out', 'in_to_out' (got '{other}')"
            ))),
        }
    }
}

/// Full description of what to capture during one extraction call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapSpec {
    /// Module path of the extraction point
    pub point: String,
    pub mode: TapMode,
    /// Fixed context length used for truncation
    pub ctx_len: usize,
}

/// Widths exposed by an extraction point, when it has them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointWidths {
    pub in_features: Option<usize>,
    pub out_features: Option<usize>,
}

/// A value read at a tap: a bare tensor or a tuple-like record of values
#[derive(Debug, Clone)]
pub enum Tapped {
    Tensor(Tensor),
    Tuple(Vec<Tapped>),
}

impl Tapped {
    /// Unwrap the first element repeatedly until a bare tensor is reached.
    pub fn into_tensor(self) -> Result<Tensor> {
        let mut current = self;
        loop {
            match current {
                Tapped::Tensor(tensor) => return Ok(tensor),
                Tapped::Tuple(items) => {
                    current = items.into_iter().next().ok_or_else(|| {
                        BufferError::shape_anomaly("tapped tuple has no elements")
                    })?;
                }
            }
        }
    }
}

impl From<Tensor> for Tapped {
    fn from(tensor: Tensor) -> Self {
        Tapped::Tensor(tensor)
    }
}

/// Raw result of running one text batch through the model
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Value at the extraction point's input, if tapped
    pub input: Option<Tapped>,
    /// Value at the extraction point's output, if tapped
    pub output: Option<Tapped>,
    /// Shape `(batch, seq_len)`, non-zero for real tokens
    pub attention_mask: Tensor,
}

impl Extraction {
    /// Bare tensors for the taps `mode` needs, input side first.
    ///
    /// A tap required by `mode` but missing from the extraction is a shape anomaly.
    pub fn into_tap_tensors(self, mode: TapMode) -> Result<Vec<Tensor>> {
        let mut tensors = Vec::with_capacity(mode.n_taps());
        if mode.taps_input() {
            let input = self
                .input
                .ok_or_else(|| BufferError::shape_anomaly("input tap is absent"))?;
            tensors.push(input.into_tensor()?);
        }
        if mode.taps_output() {
            let output = self
                .output
                .ok_or_else(|| BufferError::shape_anomaly("output tap is absent"))?;
            tensors.push(output.into_tensor()?);
        }
        Ok(tensors)
    }
}
