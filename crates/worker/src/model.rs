//! ONNX model host: tokenize, run the session, mean-pool, L2-normalize.

use std::path::{Path, PathBuf};

use ndarray::Array2;
use ort::session::Session;
use ort::value::Tensor;
use thiserror::Error;
use tokenizers::{Encoding, Tokenizer};

/// Hard cap on tokenized sequence length fed to the model.
const MAX_SEQ_LEN: usize = 512;

#[derive(Debug, Error)]
pub enum ModelError {
  #[error("model download failed: {0}")]
  Download(String),
  #[error("model load failed: {0}")]
  Load(String),
  #[error("tokenizer failure: {0}")]
  Tokenize(String),
  #[error("inference failure: {0}")]
  Inference(String),
}

/// Paths to the model artifacts inside the cache.
pub struct ModelFiles {
  pub model: PathBuf,
  pub tokenizer: PathBuf,
}

/// Fetch model artifacts from the hub into `cache_dir`, reporting byte-level
/// progress through `progress(loaded, total)`.
pub fn ensure_model<F>(model_name: &str, cache_dir: &Path, progress: F) -> Result<ModelFiles, ModelError>
where
  F: FnMut(u64, u64),
{
  use hf_hub::api::sync::ApiBuilder;

  let api = ApiBuilder::new()
    .with_cache_dir(cache_dir.to_path_buf())
    .with_progress(false)
    .build()
    .map_err(|e| ModelError::Download(e.to_string()))?;
  let repo = api.model(model_name.to_string());

  let reporter = ByteProgress {
    callback: progress,
    total: 0,
    loaded: 0,
  };
  let model = repo
    .download_with_progress("onnx/model.onnx", reporter)
    .map_err(|e| ModelError::Download(e.to_string()))?;
  let tokenizer = repo.get("tokenizer.json").map_err(|e| ModelError::Download(e.to_string()))?;

  Ok(ModelFiles { model, tokenizer })
}

struct ByteProgress<F: FnMut(u64, u64)> {
  callback: F,
  total: u64,
  loaded: u64,
}

impl<F: FnMut(u64, u64)> hf_hub::api::Progress for ByteProgress<F> {
  fn init(&mut self, size: usize, _filename: &str) {
    self.total = size as u64;
    self.loaded = 0;
    (self.callback)(0, self.total);
  }

  fn update(&mut self, size: usize) {
    self.loaded += size as u64;
    (self.callback)(self.loaded, self.total);
  }

  fn finish(&mut self) {
    (self.callback)(self.total.max(self.loaded), self.total);
  }
}

pub struct OnnxEmbedder {
  session: Session,
  tokenizer: Tokenizer,
  dim: usize,
}

impl OnnxEmbedder {
  pub fn load(files: &ModelFiles) -> Result<Self, ModelError> {
    let session = Session::builder()
      .map_err(|e| ModelError::Load(e.to_string()))?
      .commit_from_file(&files.model)
      .map_err(|e| ModelError::Load(e.to_string()))?;

    let mut tokenizer = Tokenizer::from_file(&files.tokenizer).map_err(|e| ModelError::Load(e.to_string()))?;
    tokenizer
      .with_truncation(Some(tokenizers::TruncationParams {
        max_length: MAX_SEQ_LEN,
        ..Default::default()
      }))
      .map_err(|e| ModelError::Load(e.to_string()))?;

    let mut embedder = Self {
      session,
      tokenizer,
      dim: 0,
    };
    // Probe the hidden size once so `ready` can report it.
    let probe = embedder.embed_batch(&["probe".to_string()])?;
    embedder.dim = probe.first().map(|v| v.len()).unwrap_or(0);
    Ok(embedder)
  }

  pub fn dim(&self) -> usize {
    self.dim
  }

  /// Embed a batch. Output vectors are L2-normalized so cosine similarity
  /// downstream is a plain inner product.
  pub fn embed_batch(&mut self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
    if texts.is_empty() {
      return Ok(Vec::new());
    }

    let encodings: Vec<Encoding> = texts
      .iter()
      .map(|t| self.tokenizer.encode(t.as_str(), true))
      .collect::<Result<Vec<_>, _>>()
      .map_err(|e| ModelError::Tokenize(e.to_string()))?;

    let batch = encodings.len();
    let seq_len = encodings.iter().map(Encoding::len).max().unwrap_or(1).max(1);

    let mut input_ids = Array2::<i64>::zeros((batch, seq_len));
    let mut attention_mask = Array2::<i64>::zeros((batch, seq_len));
    let token_type_ids = Array2::<i64>::zeros((batch, seq_len));
    let mut mask_rows: Vec<Vec<i64>> = Vec::with_capacity(batch);

    for (row, encoding) in encodings.iter().enumerate() {
      let ids = encoding.get_ids();
      let mask = encoding.get_attention_mask();
      for (col, (&id, &m)) in ids.iter().zip(mask.iter()).enumerate() {
        input_ids[(row, col)] = id as i64;
        attention_mask[(row, col)] = m as i64;
      }
      mask_rows.push((0..seq_len).map(|c| attention_mask[(row, c)]).collect());
    }

    let input_ids = Tensor::from_array(input_ids).map_err(|e| ModelError::Inference(e.to_string()))?;
    let attention = Tensor::from_array(attention_mask).map_err(|e| ModelError::Inference(e.to_string()))?;
    let token_types = Tensor::from_array(token_type_ids).map_err(|e| ModelError::Inference(e.to_string()))?;

    let outputs = self
      .session
      .run(ort::inputs![input_ids, attention, token_types])
      .map_err(|e| ModelError::Inference(e.to_string()))?;

    let (shape, data) = outputs[0]
      .try_extract_tensor::<f32>()
      .map_err(|e| ModelError::Inference(e.to_string()))?;
    if shape.len() != 3 {
      return Err(ModelError::Inference(format!(
        "expected rank-3 [batch, seq, hidden] output, got {shape:?}"
      )));
    }
    let hidden = shape[2] as usize;
    let out_seq = shape[1] as usize;

    Ok(mean_pool(data, &mask_rows, out_seq, hidden))
  }
}

/// Attention-masked mean pooling followed by L2 normalization.
fn mean_pool(data: &[f32], mask_rows: &[Vec<i64>], seq_len: usize, hidden: usize) -> Vec<Vec<f32>> {
  let mut results = Vec::with_capacity(mask_rows.len());
  for (b, mask) in mask_rows.iter().enumerate() {
    let mut sum = vec![0f32; hidden];
    let mut count = 0f32;
    for (t, &m) in mask.iter().enumerate().take(seq_len) {
      if m == 1 {
        let base = (b * seq_len + t) * hidden;
        for (h, s) in sum.iter_mut().enumerate() {
          *s += data[base + h];
        }
        count += 1.0;
      }
    }
    if count > 0.0 {
      for s in &mut sum {
        *s /= count;
      }
    }
    normalize_l2(&mut sum);
    results.push(sum);
  }
  results
}

fn normalize_l2(vector: &mut [f32]) {
  let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
  if norm > f32::EPSILON {
    for v in vector.iter_mut() {
      *v /= norm;
    }
  }
}
