//! tiered-cache: a multi-layer cache for async Rust services.
//!
//! Reads probe a small hot layer, a larger warm layer and an optional
//! external cold layer, promoting hits upward; evictions demote entries
//! downward instead of dropping them:
//!   hot (in-process) → warm (in-process) → cold (external backend)
//!
//! Start with [`CacheManager`].

pub mod cache;
pub mod config;
pub mod metrics;
pub mod server;

pub use cache::{CacheError, CacheEvent, CacheManager, Layer, SetOptions};
pub use config::Config;
pub use metrics::MetricsSnapshot;
