//! Local ONNX Runtime embedding backend.
//!
//! Runs all-MiniLM-L6-v2 via `ort` on a chosen [`Device`]. Handles
//! tokenization, inference, mean pooling, and L2 normalization.

use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::{l2_normalize, Device, EmbeddingBackend, EMBEDDING_DIM};
use crate::config::{expand_tilde, EmbeddingConfig};

/// Maximum sequence length for all-MiniLM-L6-v2 (trained at 256).
const MAX_SEQ_LEN: usize = 256;

/// ONNX-based embedding backend bound to one device.
pub struct LocalOnnxBackend {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    device: Device,
}

// Safety: Tokenizer is Send+Sync. Session is behind a Mutex.
// The Mutex guarantees exclusive access during run().
unsafe impl Send for LocalOnnxBackend {}
unsafe impl Sync for LocalOnnxBackend {}

/// Accelerator registration that fails loudly instead of silently
/// running on CPU, so the caller can record the real device.
fn execution_provider(device: Device) -> Option<ExecutionProviderDispatch> {
    match device {
        Device::Cuda => Some(CUDAExecutionProvider::default().build().error_on_failure()),
        Device::CoreMl => Some(CoreMLExecutionProvider::default().build().error_on_failure()),
        Device::Cpu => None,
    }
}

impl LocalOnnxBackend {
    /// Load model and tokenizer from `config.cache_dir` onto `device`.
    pub fn load(config: &EmbeddingConfig, device: Device) -> Result<Self> {
        let cache_dir = expand_tilde(&config.cache_dir);
        let model_path = cache_dir.join("model.onnx");
        let tokenizer_path = cache_dir.join("tokenizer.json");

        anyhow::ensure!(
            model_path.exists(),
            "ONNX model not found at {}. Run `archivist model download` first.",
            model_path.display()
        );
        anyhow::ensure!(
            tokenizer_path.exists(),
            "Tokenizer not found at {}. Run `archivist model download` first.",
            tokenizer_path.display()
        );

        let mut builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;
        if let Some(provider) = execution_provider(device) {
            builder = builder
                .with_execution_providers([provider])
                .with_context(|| format!("{device} execution provider rejected"))?;
        }
        let session = builder
            .commit_from_file(&model_path)
            .with_context(|| format!("failed to load ONNX model on {device}"))?;

        tracing::info!(model = %model_path.display(), %device, "ONNX model loaded");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;

        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            device,
        })
    }
}

impl EmbeddingBackend for LocalOnnxBackend {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;

        let batch_size = encodings.len();
        let seq_len = encodings[0].get_ids().len();

        let mut input_ids_flat = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask_flat = Vec::with_capacity(batch_size * seq_len);

        for encoding in &encodings {
            for &id in encoding.get_ids() {
                input_ids_flat.push(id as i64);
            }
            for &mask in encoding.get_attention_mask() {
                attention_mask_flat.push(mask as i64);
            }
        }

        let shape = vec![batch_size as i64, seq_len as i64];
        let input_ids_tensor =
            Tensor::from_array((shape.clone(), input_ids_flat.into_boxed_slice()))?;
        let attention_mask_tensor =
            Tensor::from_array((shape.clone(), attention_mask_flat.clone().into_boxed_slice()))?;
        // token_type_ids: all zeros (single sentence, no segment B)
        let token_type_ids = vec![0i64; batch_size * seq_len];
        let token_type_ids_tensor =
            Tensor::from_array((shape, token_type_ids.into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;

        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids_tensor,
            "attention_mask" => attention_mask_tensor,
            "token_type_ids" => token_type_ids_tensor,
        })?;

        // The output name varies by ONNX export. Try common names, fall back to index 0.
        let token_emb_value = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);

        let (shape, data) = token_emb_value
            .try_extract_tensor::<f32>()
            .context("failed to extract token_embeddings tensor")?;

        let dims: &[i64] = &shape;
        anyhow::ensure!(
            dims.len() == 3 && dims[2] == EMBEDDING_DIM as i64,
            "unexpected token_embeddings shape: {dims:?}, expected [batch, seq, {EMBEDDING_DIM}]"
        );
        let hidden_dim = dims[2] as usize;
        let actual_seq_len = dims[1] as usize;

        // Mean pooling with attention mask
        let mut results = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            let mut sum = vec![0.0f32; hidden_dim];
            let mut count = 0.0f32;

            for s in 0..actual_seq_len {
                let mask = attention_mask_flat[b * seq_len + s] as f32;
                if mask > 0.0 {
                    let offset = (b * actual_seq_len + s) * hidden_dim;
                    for d in 0..hidden_dim {
                        sum[d] += data[offset + d] * mask;
                    }
                    count += mask;
                }
            }

            if count > 0.0 {
                for value in sum.iter_mut() {
                    *value /= count;
                }
            }

            results.push(l2_normalize(&sum));
        }

        Ok(results)
    }

    fn device(&self) -> Device {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EmbeddingConfig {
        EmbeddingConfig {
            cache_dir: crate::config::default_archivist_dir()
                .join("models")
                .to_string_lossy()
                .into_owned(),
            ..EmbeddingConfig::default()
        }
    }

    #[test]
    fn missing_model_is_an_error() {
        let config = EmbeddingConfig {
            cache_dir: "/nonexistent/archivist/models".into(),
            ..EmbeddingConfig::default()
        };
        let err = LocalOnnxBackend::load(&config, Device::Cpu).err().unwrap();
        assert!(err.to_string().contains("model download"));
    }

    #[test]
    #[ignore] // Requires model files, run with: cargo test -- --ignored
    fn test_embed_produces_384_dims() {
        let backend = LocalOnnxBackend::load(&test_config(), Device::Cpu).unwrap();
        let embedding = backend.embed_batch(&["Hello world"]).unwrap();
        assert_eq!(embedding[0].len(), EMBEDDING_DIM);
    }

    #[test]
    #[ignore]
    fn test_embed_batch_is_normalized() {
        let backend = LocalOnnxBackend::load(&test_config(), Device::Cpu).unwrap();
        let embeddings = backend
            .embed_batch(&["First sentence", "Second sentence", "Third sentence"])
            .unwrap();
        assert_eq!(embeddings.len(), 3);
        for emb in &embeddings {
            let norm: f32 = emb.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    #[ignore]
    fn test_similar_texts_rank_higher() {
        let backend = LocalOnnxBackend::load(&test_config(), Device::Cpu).unwrap();
        let embs = backend
            .embed_batch(&[
                "The cat sat on the mat",
                "A cat was sitting on a mat",
                "Quantum computing uses qubits",
            ])
            .unwrap();
        let similar = crate::archive::search::cosine_similarity(&embs[0], &embs[1]);
        let different = crate::archive::search::cosine_similarity(&embs[0], &embs[2]);
        assert!(similar > 0.7, "got {similar}");
        assert!(different < similar);
    }
}
