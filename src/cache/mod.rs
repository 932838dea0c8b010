//! Multi-layer cache.
//!
//! - [`entry`]: Layer, CacheEntry and write options
//! - [`tracker`]: Recency/frequency history shared by all layers
//! - [`eviction`]: Eviction policies and victim selection
//! - [`layer`]: Bounded, TTL-aware in-process layer
//! - [`backend`]: External (cold) layer trait and the in-memory default
//! - [`codec`]: JSON + zstd boundary of the cold layer
//! - [`events`]: Notification channel
//! - [`manager`]: CacheManager, the public entry point

pub mod backend;
pub mod codec;
pub mod entry;
pub mod error;
pub mod events;
pub mod eviction;
pub mod layer;
pub mod manager;
pub mod tracker;

pub use backend::{BackendError, ColdRecord, ExternalBackend, MemoryBackend};
pub use entry::{CacheEntry, EntryMetadata, Layer, Priority, SetOptions};
pub use error::{CacheError, CacheResult};
pub use events::CacheEvent;
pub use eviction::EvictionPolicy;
pub use manager::{CacheManager, CacheValue, EntryInfo, MissHook, PrefetchReport};
