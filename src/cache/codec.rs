//! Value codec: the serialize/deserialize boundary of the cache.
//!
//! In-process layers keep typed values and only use the codec to measure
//! them. Values crossing into the external layer are JSON-encoded and, above
//! the configured threshold, zstd-compressed. Decoding reverses the pipeline.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Zstd compression failed: {0}")]
    Zstd(#[from] std::io::Error),
}

/// An encoded value ready for the external layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub payload: Bytes,
    pub compressed: bool,
    /// Set when compression was attempted and failed; the payload is then plain JSON.
    pub compression_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Codec {
    compression_enabled: bool,
    threshold: usize,
    zstd_level: i32,
}

impl Codec {
    pub fn new(compression_enabled: bool, threshold: usize, zstd_level: i32) -> Self {
        Self {
            compression_enabled,
            threshold,
            zstd_level,
        }
    }

    /// Size of `value` once encoded, used for byte-cap accounting.
    pub fn encoded_size<V: Serialize>(&self, value: &V) -> Result<usize, CodecError> {
        Ok(serde_json::to_vec(value)?.len())
    }

    /// Encode a value, compressing it when it exceeds the threshold.
    ///
    /// Only JSON failures are errors. A compression failure falls back to the
    /// uncompressed payload and is reported in [`Encoded::compression_error`].
    pub fn encode<V: Serialize>(&self, value: &V) -> Result<Encoded, CodecError> {
        let json = serde_json::to_vec(value)?;
        let mut compression_error = None;

        if self.compression_enabled && json.len() > self.threshold {
            match self.zstd_compress(&json) {
                // Incompressible payloads are kept as-is.
                Ok(compressed) if compressed.len() < json.len() => {
                    return Ok(Encoded {
                        payload: Bytes::from(compressed),
                        compressed: true,
                        compression_error: None,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Compression failed, storing uncompressed");
                    compression_error = Some(e.to_string());
                }
            }
        }

        Ok(Encoded {
            payload: Bytes::from(json),
            compressed: false,
            compression_error,
        })
    }

    pub fn decode<V: DeserializeOwned>(&self, payload: &[u8], compressed: bool) -> Result<V, CodecError> {
        if compressed {
            let json = self.zstd_decompress(payload)?;
            Ok(serde_json::from_slice(&json)?)
        } else {
            Ok(serde_json::from_slice(payload)?)
        }
    }

    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let compressed = zstd::encode_all(data, self.zstd_level)?;
        Ok(compressed)
    }

    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let decompressed = zstd::decode_all(data)?;
        Ok(decompressed)
    }
}
