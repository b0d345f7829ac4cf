//! Text-to-vector embedding pipeline.
//!
//! An [`EmbeddingBackend`] is a loaded model. Backends are produced by a
//! [`BackendLoader`] for a given [`Device`], and their lifecycle (lazy load,
//! device fallback, idle unload, usage stats) is owned by
//! [`service::EmbeddingService`].

pub mod local;
pub mod service;

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;

/// Number of dimensions in the embedding vectors (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Inference device, in probe order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// Discrete GPU via CUDA.
    Cuda,
    /// Platform-integrated accelerator (Apple Neural Engine / GPU).
    CoreMl,
    Cpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::CoreMl => "coreml",
            Self::Cpu => "cpu",
        }
    }

    /// Devices to try, best first. CPU is always the final fallback.
    pub fn preference_order(override_device: Option<Device>) -> Vec<Device> {
        match override_device {
            Some(Device::Cpu) => vec![Device::Cpu],
            Some(device) => vec![device, Device::Cpu],
            None => vec![Device::Cuda, Device::CoreMl, Device::Cpu],
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "coreml" | "mps" | "metal" => Ok(Self::CoreMl),
            "cpu" => Ok(Self::Cpu),
            _ => Err(format!("unknown device: {s}")),
        }
    }
}

/// A loaded embedding model.
///
/// Implementations produce L2-normalized vectors of [`dimensions`](Self::dimensions)
/// length and must tolerate concurrent calls (serializing internally if the
/// runtime needs exclusive access).
pub trait EmbeddingBackend: Send + Sync {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    fn device(&self) -> Device {
        Device::Cpu
    }
}

/// Builds a backend on the requested device. Errors mean "this device
/// rejected the model"; the service moves on to the next device.
pub type BackendLoader = Arc<dyn Fn(Device) -> Result<Box<dyn EmbeddingBackend>> + Send + Sync>;

/// Create the loader described by config. `None` means embeddings are disabled.
pub fn create_loader(config: &EmbeddingConfig) -> Result<Option<BackendLoader>> {
    match config.provider.as_str() {
        "local" => {
            let config = config.clone();
            Ok(Some(Arc::new(move |device| {
                let backend = local::LocalOnnxBackend::load(&config, device)?;
                Ok(Box::new(backend) as Box<dyn EmbeddingBackend>)
            })))
        }
        "hashing" => Ok(Some(Arc::new(|_device| {
            Ok(Box::new(HashingBackend::new(EMBEDDING_DIM)) as Box<dyn EmbeddingBackend>)
        }))),
        "disabled" | "none" => Ok(None),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, hashing, disabled"),
    }
}

/// Deterministic, model-free backend: hashes lowercase word tokens into
/// buckets and L2-normalizes the counts. Texts sharing words have positive
/// cosine similarity; disjoint vocabularies score (almost always) zero.
pub struct HashingBackend {
    dims: usize,
}

impl HashingBackend {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let bucket = u64::from_le_bytes([
                digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
                digest[7],
            ]) as usize
                % self.dims;
            v[bucket] += 1.0;
        }
        l2_normalize(&v)
    }
}

impl EmbeddingBackend for HashingBackend {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// L2-normalize a vector. Returns the input unchanged if its norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// True when every component is (numerically) zero: the "no embedding"
/// sentinel.
pub fn is_zero_vector(v: &[f32]) -> bool {
    v.iter().all(|x| x.abs() <= f32::EPSILON)
}
