//! Integration tests for actbuf-rs
//!
//! A counting tokenizer gives every word a fresh id, and the tap model echoes
//! that id into the activations, so each served row can be traced back to
//! its source token.
//!
//! Note: Tests marked with #[ignore] require a tokenizer download.
//! Run them explicitly with: cargo test --ignored

use std::cell::Cell;
use std::collections::HashSet;
use std::io::Write;

use actbuf_rs::{
    ActivationBuffer, Batch, BatchTokenizer, BufferConfig, BufferError, IterTextStream,
    JsonlTextStream, LinearStack, LinearStackConfig, PointWidths, Result, TapMode, TapModel,
    Taps, Tapped, TokenizedBatch, TokenizedExtractor,
};
use candle_core::{DType, Device, Tensor};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tempfile::NamedTempFile;

const IN_WIDTH: usize = 8;
const OUT_WIDTH: usize = 4;
const OUT_OFFSET: f32 = 1000.0;

/// Each whitespace word gets the next id, starting at 1 (0 is padding)
#[derive(Default)]
struct CountingTokenizer {
    next: Cell<u32>,
}

impl BatchTokenizer for CountingTokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .split_whitespace()
            .map(|_| {
                let id = self.next.get() + 1;
                self.next.set(id);
                id
            })
            .collect())
    }
}

/// Input tap = token id, output tap = token id + OUT_OFFSET (wrapped in a tuple)
struct EchoModel {
    device: Device,
    widths: PointWidths,
}

impl EchoModel {
    fn new() -> Self {
        Self {
            device: Device::Cpu,
            widths: PointWidths {
                in_features: Some(IN_WIDTH),
                out_features: Some(OUT_WIDTH),
            },
        }
    }
}

impl TapModel for EchoModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn point_widths(&self, _point: &str) -> Result<PointWidths> {
        Ok(self.widths)
    }

    fn forward_tapped(&self, batch: &TokenizedBatch, _point: &str, mode: TapMode) -> Result<Taps> {
        let (b, s) = (batch.batch_size(), batch.seq_len());
        let ids = batch.input_ids.to_dtype(DType::F32)?.unsqueeze(2)?;
        let input = ids.broadcast_as((b, s, IN_WIDTH))?.contiguous()?;
        let output = (ids.broadcast_as((b, s, OUT_WIDTH))?.contiguous()? + f64::from(OUT_OFFSET))?;
        let attn = Tensor::zeros((b, s, s), DType::F32, &self.device)?;
        Ok(Taps {
            input: mode.taps_input().then(|| input.into()),
            output: mode.taps_output().then(|| {
                Tapped::Tuple(vec![Tapped::Tuple(vec![output.into()]), attn.into()])
            }),
        })
    }
}

fn extractor() -> TokenizedExtractor<CountingTokenizer, EchoModel> {
    TokenizedExtractor::new(CountingTokenizer::default(), EchoModel::new())
}

/// `n` texts of `len` words each
fn texts(n: usize, len: usize) -> IterTextStream<impl Iterator<Item = String>> {
    IterTextStream::new((0..n).map(move |i| {
        (0..len)
            .map(|j| format!("w{i}_{j}"))
            .collect::<Vec<_>>()
            .join(" ")
    }))
}

fn scenario_config(mode: TapMode) -> BufferConfig {
    BufferConfig {
        point: "layers.0".to_string(),
        mode,
        n_ctxs: 1,
        ctx_len: 4,
        in_batch_size: 2,
        out_batch_size: 2,
        seed: Some(42),
        ..Default::default()
    }
}

/// Token ids carried in the first column of `(n, d)` rows
fn ids(rows: &Tensor) -> Vec<u32> {
    rows.narrow(1, 0, 1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .into_iter()
        .map(|v| v as u32)
        .collect()
}

#[test]
fn test_scenario_single_tap_out() {
    let mut buffer =
        ActivationBuffer::new(texts(4, 4), extractor(), scenario_config(TapMode::Out)).unwrap();

    let batch = buffer.next_batch().unwrap().into_single().unwrap();
    assert_eq!(batch.dims(), &[2, OUT_WIDTH]);

    // Target occupancy is 1 * 4, so one ingestion of 2 texts x 4 tokens suffices
    assert_eq!(buffer.len(), 8);
    assert_eq!(buffer.unconsumed(), 6);
}

#[test]
fn test_scenario_full_corpus_refill() {
    // Target occupancy 16 needs both ingestion batches of the 4-text corpus
    let config = BufferConfig {
        n_ctxs: 4,
        ..scenario_config(TapMode::Out)
    };
    let mut buffer = ActivationBuffer::new(texts(4, 4), extractor(), config).unwrap();

    let batch = buffer.next_batch().unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(buffer.len(), 16);
    assert_eq!(buffer.unconsumed(), 14);
}

#[test]
fn test_scenario_dual_tap() {
    let config = BufferConfig {
        n_ctxs: 4,
        ..scenario_config(TapMode::InToOut)
    };
    let mut buffer = ActivationBuffer::new(texts(4, 4), extractor(), config).unwrap();

    let (input, output) = buffer.next_batch().unwrap().into_pair().unwrap();
    assert_eq!(input.dims(), &[2, IN_WIDTH]);
    assert_eq!(output.dims(), &[2, OUT_WIDTH]);
    for (i, o) in ids(&input).iter().zip(ids(&output)) {
        assert_eq!(i + OUT_OFFSET as u32, o);
    }

    let store = buffer.store();
    assert_eq!(store.n_taps(), 2);
    assert_eq!(store.len(), 16);
    assert_eq!(store.unconsumed(), 14);
}

#[test]
fn test_no_double_serving_across_refills() {
    let config = BufferConfig {
        n_ctxs: 3,
        ctx_len: 5,
        in_batch_size: 2,
        out_batch_size: 3,
        seed: Some(1),
        ..Default::default()
    };
    let n_texts = 40;
    let words = 5;
    let buffer = ActivationBuffer::new(texts(n_texts, words), extractor(), config).unwrap();

    let mut seen = HashSet::new();
    for batch in buffer {
        let rows = batch.unwrap().into_single().unwrap();
        for id in ids(&rows) {
            assert!(id >= 1 && id as usize <= n_texts * words);
            assert!(seen.insert(id), "token {id} served twice");
        }
    }
    assert!(!seen.is_empty());
}

#[test]
fn test_dual_tap_alignment_over_many_batches() {
    let config = BufferConfig {
        mode: TapMode::InToOut,
        n_ctxs: 4,
        ctx_len: 6,
        in_batch_size: 3,
        out_batch_size: 5,
        seed: Some(9),
        ..Default::default()
    };
    let mut buffer = ActivationBuffer::new(texts(60, 6), extractor(), config).unwrap();

    for _ in 0..40 {
        let batch = match buffer.next_batch() {
            Ok(batch) => batch,
            Err(err) if err.is_exhausted() => break,
            Err(err) => panic!("unexpected error: {err}"),
        };
        let Batch::Pair { input, output } = batch else {
            panic!("dual-tap buffer returned a single tensor");
        };
        assert_eq!(input.dims()[0], output.dims()[0]);
        for (i, o) in ids(&input).iter().zip(ids(&output)) {
            assert_eq!(i + OUT_OFFSET as u32, o);
        }
        assert_eq!(buffer.store().gather(&[]).unwrap().len(), 2);
    }
}

#[test]
fn test_uniform_sampling() {
    // One ingestion of 5 texts x 4 words fills the store with exactly N = 20 rows
    let n = 20usize;
    let b = 5usize;
    let trials = 2000usize;
    let mut counts = vec![0usize; n];

    for trial in 0..trials {
        let config = BufferConfig {
            n_ctxs: 5,
            ctx_len: 4,
            in_batch_size: 5,
            out_batch_size: b,
            seed: Some(trial as u64),
            ..Default::default()
        };
        let mut buffer = ActivationBuffer::new(texts(5, 4), extractor(), config).unwrap();
        let rows = buffer.next_batch().unwrap().into_single().unwrap();
        assert_eq!(buffer.len(), n);
        let picked = ids(&rows);
        assert_eq!(picked.iter().collect::<HashSet<_>>().len(), b);
        for id in picked {
            counts[id as usize - 1] += 1;
        }
    }

    let expected = (trials * b) as f64 / n as f64;
    for &c in &counts {
        let p = c as f64 / trials as f64;
        assert!((p - b as f64 / n as f64).abs() < 0.05, "frequency {p} far from B/N");
    }
    let chi2: f64 = counts
        .iter()
        .map(|&c| (c as f64 - expected).powi(2) / expected)
        .sum();
    let dist = ChiSquared::new((n - 1) as f64).unwrap();
    let p_value = 1.0 - dist.cdf(chi2);
    assert!(p_value > 0.001, "chi2 {chi2:.2}, p = {p_value:.5}");
}

#[test]
fn test_mask_filtering_drops_padding() {
    // Batch of 4 texts with 1, 3, 2, 4 tokens: M = 16 positions, P = 6 padding
    let lengths = [1usize, 3, 2, 4];
    let stream = IterTextStream::new(lengths.into_iter().map(|len| vec!["x"; len].join(" ")));
    let config = BufferConfig {
        n_ctxs: 1,
        ctx_len: 8,
        in_batch_size: 4,
        out_batch_size: 1,
        seed: Some(3),
        ..Default::default()
    };
    let mut buffer = ActivationBuffer::new(stream, extractor(), config).unwrap();

    buffer.refresh().unwrap();
    assert_eq!(buffer.len(), 16 - 6);

    let all: Vec<u32> = (0..buffer.len() as u32).collect();
    let mut served = ids(&buffer.store().gather(&all).unwrap()[0]);
    served.sort_unstable();
    assert_eq!(served, (1..=10).collect::<Vec<u32>>());
}

#[test]
fn test_exhaustion_leaves_no_partial_rows() {
    let mut buffer =
        ActivationBuffer::new(texts(1, 4), extractor(), scenario_config(TapMode::Out)).unwrap();

    let err = buffer.next_batch().unwrap_err();
    assert!(matches!(
        err,
        BufferError::Exhausted {
            requested: 2,
            available: 1
        }
    ));
    assert!(buffer.is_empty());
    assert!(buffer.is_exhausted());

    // Fatal to later calls as well
    assert!(buffer.next_batch().unwrap_err().is_exhausted());
    assert!(buffer.refresh().is_err());
    assert!(buffer.next().is_none());
}

#[test]
fn test_exhaustion_mid_refill_keeps_complete_batches() {
    // Needs two ingestions; the second finds only one text
    let config = BufferConfig {
        n_ctxs: 4,
        ..scenario_config(TapMode::Out)
    };
    let mut buffer = ActivationBuffer::new(texts(3, 4), extractor(), config).unwrap();

    assert!(buffer.refresh().unwrap_err().is_exhausted());
    assert_eq!(buffer.len(), 8);
    assert_eq!(buffer.unconsumed(), 8);
}

#[test]
fn test_occupancy_after_each_batch() {
    let config = BufferConfig {
        n_ctxs: 4,
        ctx_len: 4,
        in_batch_size: 2,
        out_batch_size: 3,
        seed: Some(5),
        ..Default::default()
    };
    let threshold = config.refill_threshold();
    let out_batch = config.out_batch_size;
    let mut buffer = ActivationBuffer::new(texts(50, 4), extractor(), config).unwrap();

    let mut refills = 0;
    loop {
        let before = buffer.unconsumed();
        match buffer.next_batch() {
            Ok(batch) => {
                assert_eq!(batch.len(), out_batch);
                if before < threshold {
                    refills += 1;
                    // Refill restores the target before sampling
                    assert!(buffer.unconsumed() + out_batch >= 16);
                }
                assert!(buffer.unconsumed() + out_batch >= threshold);
                // consumed rows stay until the next refill
                let consumed = (0..buffer.len())
                    .filter(|&i| buffer.store().is_consumed(i) == Some(true))
                    .count();
                assert_eq!(buffer.len(), buffer.unconsumed() + consumed);
            }
            Err(err) => {
                assert!(err.is_exhausted());
                break;
            }
        }
    }
    assert!(refills > 1);
}

#[test]
fn test_config_error_when_width_unknown() {
    let model = EchoModel {
        device: Device::Cpu,
        widths: PointWidths {
            in_features: Some(IN_WIDTH),
            out_features: None,
        },
    };
    let result = ActivationBuffer::new(
        texts(4, 4),
        TokenizedExtractor::new(CountingTokenizer::default(), model),
        scenario_config(TapMode::Out),
    );
    match result {
        Err(BufferError::Config { message }) => {
            assert!(message.contains("out_feats cannot be inferred"));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("construction should fail"),
    }
}

#[test]
fn test_close_stops_ingestion() {
    let mut buffer =
        ActivationBuffer::new(texts(10, 4), extractor(), scenario_config(TapMode::Out)).unwrap();
    buffer.next_batch().unwrap();
    buffer.close().unwrap();
    buffer.close().unwrap();

    // 6 rows left above the threshold of 2: served without ingesting
    buffer.next_batch().unwrap();
    buffer.next_batch().unwrap();
    assert_eq!(buffer.unconsumed(), 2);
    buffer.next_batch().unwrap();
    assert_eq!(buffer.unconsumed(), 0);

    assert!(matches!(buffer.next_batch(), Err(BufferError::Closed)));
    assert!(buffer.next().is_none());
}

#[test]
fn test_jsonl_corpus_through_linear_stack() {
    let mut file = NamedTempFile::new().unwrap();
    for i in 0..12 {
        writeln!(file, r#"{{"text": "sample {i} with a few words"}}"#).unwrap();
    }

    let model = LinearStack::random(
        LinearStackConfig {
            vocab_size: 512,
            hidden_sizes: vec![16, 12, 8],
        },
        &Device::Cpu,
    )
    .unwrap();
    let config = BufferConfig {
        point: "layers.1".to_string(),
        mode: TapMode::InToOut,
        n_ctxs: 2,
        ctx_len: 4,
        in_batch_size: 3,
        out_batch_size: 4,
        seed: Some(11),
        ..Default::default()
    };
    let stream = JsonlTextStream::open(file.path()).unwrap();
    let mut buffer = ActivationBuffer::new(
        stream,
        TokenizedExtractor::new(CountingTokenizer::default(), model),
        config,
    )
    .unwrap();
    assert_eq!(buffer.store().widths(), &[12, 8]);

    let (input, output) = buffer.next_batch().unwrap().into_pair().unwrap();
    assert_eq!(input.dims(), &[4, 12]);
    assert_eq!(output.dims(), &[4, 8]);
    // 3 texts truncated to 4 tokens each
    assert_eq!(buffer.len(), 12);

    let tokens = buffer.tokenized_batch(None).unwrap();
    assert_eq!(tokens.batch_size(), 3);
    assert_eq!(tokens.seq_len(), 4);
    buffer.close().unwrap();
}

#[test]
fn test_embedding_input_needs_explicit_width() {
    let model = LinearStack::random(
        LinearStackConfig {
            vocab_size: 64,
            hidden_sizes: vec![8, 8],
        },
        &Device::Cpu,
    )
    .unwrap();
    let config = BufferConfig {
        point: "embed".to_string(),
        mode: TapMode::In,
        ..scenario_config(TapMode::In)
    };
    let result = ActivationBuffer::new(
        texts(4, 4),
        TokenizedExtractor::new(CountingTokenizer::default(), model),
        config,
    );
    assert!(matches!(result, Err(BufferError::Config { .. })));
}

#[test]
fn test_embedding_input_is_shape_anomaly() {
    let model = LinearStack::random(
        LinearStackConfig {
            vocab_size: 64,
            hidden_sizes: vec![8, 8],
        },
        &Device::Cpu,
    )
    .unwrap();
    let config = BufferConfig {
        point: "embed".to_string(),
        in_feats: Some(8),
        ..scenario_config(TapMode::In)
    };
    let mut buffer = ActivationBuffer::new(
        texts(4, 4),
        TokenizedExtractor::new(CountingTokenizer::default(), model),
        config,
    )
    .unwrap();

    let err = buffer.next_batch().unwrap_err();
    assert!(matches!(err, BufferError::ShapeAnomaly { .. }));
    assert!(buffer.is_empty());
    assert!(!buffer.is_exhausted());
}

/// Real tokenizer end to end
#[test]
#[ignore = "requires tokenizer download"]
fn test_gpt2_tokenizer_buffer() {
    use hf_hub::{api::sync::Api, Repo, RepoType};
    use tokenizers::Tokenizer;

    let api = Api::new().unwrap();
    let repo = api.repo(Repo::new("gpt2".to_string(), RepoType::Model));
    let tokenizer = Tokenizer::from_file(repo.get("tokenizer.json").unwrap()).unwrap();

    let model = LinearStack::random(
        LinearStackConfig {
            vocab_size: tokenizer.get_vocab_size(true),
            hidden_sizes: vec![32, 32],
        },
        &Device::Cpu,
    )
    .unwrap();
    let stream = IterTextStream::new(
        (0..64).map(|i| format!("The quick brown fox number {i} jumps over the lazy dog.")),
    );
    let config = BufferConfig {
        n_ctxs: 4,
        ctx_len: 8,
        in_batch_size: 4,
        out_batch_size: 16,
        ..Default::default()
    };
    let mut buffer =
        ActivationBuffer::new(stream, TokenizedExtractor::new(tokenizer, model), config).unwrap();
    let acts = buffer.next_batch().unwrap().into_single().unwrap();
    assert_eq!(acts.dims(), &[16, 32]);
}
