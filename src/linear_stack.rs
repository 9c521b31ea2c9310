//! LinearStack: a small tappable model built from candle-nn layers
//!
//! Token embedding followed by a stack of `Linear + GELU` blocks. Extraction
//! points are `"embed"` and `"layers.{i}"`. Linear blocks expose their
//! input/output widths; the embedding only exposes its output width, so
//! tapping its input needs an explicit width and then fails as a shape
//! anomaly because token ids are not activations.
//!
//! Weights load from a directory holding `config.json` and
//! `model.safetensors` with tensors named `embed.weight`,
//! `layers.{i}.weight` and `layers.{i}.bias`.

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BufferError, Result};
use crate::model::{TapModel, Taps};
use crate::tap::{PointWidths, TapMode};
use crate::tokenize::TokenizedBatch;

/// Model configuration (`config.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearStackConfig {
    pub vocab_size: usize,
    /// Widths of the residual stream: embedding output first, then one per block
    pub hidden_sizes: Vec<usize>,
}

impl LinearStackConfig {
    /// Number of linear blocks
    pub fn n_layers(&self) -> usize {
        self.hidden_sizes.len().saturating_sub(1)
    }

    fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_sizes.is_empty() {
            return Err(BufferError::config(
                "LinearStack needs a vocab_size and at least one hidden size",
            ));
        }
        if self.hidden_sizes.contains(&0) {
            return Err(BufferError::config("hidden sizes must be positive"));
        }
        Ok(())
    }
}

/// Where in the stack a tap reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Point {
    Embed,
    Layer(usize),
}

pub struct LinearStack {
    config: LinearStackConfig,
    embed: Embedding,
    layers: Vec<Linear>,
    device: Device,
}

impl LinearStack {
    /// Build the model from a VarBuilder
    pub fn load(config: LinearStackConfig, vb: VarBuilder, device: &Device) -> Result<Self> {
        config.validate()?;
        let embed = embedding(config.vocab_size, config.hidden_sizes[0], vb.pp("embed"))?;
        let mut layers = Vec::with_capacity(config.n_layers());
        for i in 0..config.n_layers() {
            let layer = linear(
                config.hidden_sizes[i],
                config.hidden_sizes[i + 1],
                vb.pp(format!("layers.{i}")),
            )?;
            layers.push(layer);
        }
        debug!(
            "LinearStack built: vocab {}, widths {:?}",
            config.vocab_size, config.hidden_sizes
        );
        Ok(Self {
            config,
            embed,
            layers,
            device: device.clone(),
        })
    }

    /// Randomly initialised model, handy for smoke runs
    pub fn random(config: LinearStackConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Self::load(config, vb, device)
    }

    /// Load `config.json` and `model.safetensors` from a directory
    pub fn from_dir(dir: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let config: LinearStackConfig =
            serde_json::from_str(&std::fs::read_to_string(dir.join("config.json"))?)?;
        let weights = dir.join("model.safetensors");
        info!("Loading LinearStack weights from {}", weights.display());
        // Safety: the weights file is not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        Self::load(config, vb, device)
    }

    pub fn config(&self) -> &LinearStackConfig {
        &self.config
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    fn parse_point(&self, point: &str) -> Result<Point> {
        if point == "embed" {
            return Ok(Point::Embed);
        }
        let layer = point
            .strip_prefix("layers.")
            .and_then(|i| i.parse::<usize>().ok())
            .ok_or_else(|| BufferError::config(format!("unknown extraction point '{point}'")))?;
        if layer >= self.layers.len() {
            return Err(BufferError::config(format!(
                "extraction point '{point}' out of range ({} layers)",
                self.layers.len()
            )));
        }
        Ok(Point::Layer(layer))
    }
}

impl TapModel for LinearStack {
    fn device(&self) -> &Device {
        &self.device
    }

    fn point_widths(&self, point: &str) -> Result<PointWidths> {
        Ok(match self.parse_point(point)? {
            Point::Embed => PointWidths {
                in_features: None,
                out_features: Some(self.config.hidden_sizes[0]),
            },
            Point::Layer(i) => PointWidths {
                in_features: Some(self.config.hidden_sizes[i]),
                out_features: Some(self.config.hidden_sizes[i + 1]),
            },
        })
    }

    fn forward_tapped(&self, batch: &TokenizedBatch, point: &str, mode: TapMode) -> Result<Taps> {
        let point = self.parse_point(point)?;
        let mut hidden = self.embed.forward(&batch.input_ids)?;

        let target = match point {
            Point::Embed => {
                // Token ids are the embedding's input; there is no activation to tap
                return Ok(Taps {
                    input: None,
                    output: mode.taps_output().then(|| hidden.into()),
                });
            }
            Point::Layer(i) => i,
        };

        let mut input: Option<Tensor> = None;
        for (i, layer) in self.layers.iter().enumerate().take(target + 1) {
            if i == target && mode.taps_input() {
                input = Some(hidden.clone());
            }
            hidden = layer.forward(&hidden)?.gelu()?;
        }

        Ok(Taps {
            input: input.map(Into::into),
            output: mode.taps_output().then(|| hidden.into()),
        })
    }
}
