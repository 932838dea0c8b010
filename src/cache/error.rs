//! Error types of the public cache API.

use thiserror::Error;

use crate::cache::backend::BackendError;
use crate::cache::codec::CodecError;
use crate::cache::entry::Layer;

#[derive(Error, Debug)]
pub enum CacheError {
    /// A cold-layer call failed or timed out. Only that layer is affected.
    #[error("{layer} layer unavailable: {source}")]
    BackendUnavailable {
        layer: Layer,
        #[source]
        source: BackendError,
    },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] CodecError),

    /// Eviction could not bring the layer back within its caps.
    #[error("{layer} layer cannot make room for `{key}` ({size_bytes} bytes)")]
    CapacityExceeded {
        layer: Layer,
        key: String,
        size_bytes: usize,
    },

    #[error("TTL must be greater than zero")]
    InvalidTtl,

    #[error("Cache manager has been stopped")]
    Stopped,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cache manager must be created inside a Tokio runtime")]
    NoRuntime,

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;
