pub mod chunk;
pub mod search;
pub mod store;
pub mod types;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Canonical stored timestamp: UTC RFC 3339 with microseconds, so stored
/// values compare correctly as strings.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Serialize a vector as contiguous little-endian f32s.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len() * std::mem::size_of::<f32>());
    for value in embedding {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Inverse of [`embedding_to_bytes`]. Trailing bytes that do not form a full
/// f32 are ignored.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Hex SHA-256 of raw content; the dedup key.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
