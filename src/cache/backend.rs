//! External (cold) layer backends.
//!
//! The manager only talks to [`ExternalBackend`]; values cross this boundary
//! already encoded, so backends never see the cached type. [`MemoryBackend`]
//! is the in-process default. Network-backed stores implement the same trait
//! outside this crate.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::entry::Priority;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend has been closed")]
    Closed,
}

/// A type-erased value stored in the external layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColdRecord {
    pub payload: Bytes,
    pub compressed: bool,
    pub tags: HashSet<String>,
    pub priority: Priority,
    /// Lifetime left when read back; ignored on write.
    pub remaining_ttl: Option<Duration>,
}

/// Asynchronous interface of an optional cold/overflow layer.
#[async_trait]
pub trait ExternalBackend: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &str;

    /// Fetch a live record; expired records read as `None`.
    async fn get(&self, key: &str) -> Result<Option<ColdRecord>, BackendError>;

    async fn set(&self, key: &str, record: ColdRecord, ttl: Duration) -> Result<(), BackendError>;

    /// Remove a key; removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn clear(&self) -> Result<(), BackendError>;

    /// Drop expired records, returning how many went. Stores that expire
    /// records on their own keep the default.
    async fn sweep_expired(&self) -> Result<usize, BackendError> {
        Ok(0)
    }

    /// Release the connection. Later calls fail with [`BackendError::Closed`].
    async fn close(&self) -> Result<(), BackendError>;
}

struct StoredRecord {
    record: ColdRecord,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryBackendStats {
    pub total_reads: AtomicU64,
    pub total_writes: AtomicU64,
    pub total_bytes_written: AtomicU64,
}

/// In-memory backend with lazy expiry, the default cold layer.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, StoredRecord>>,
    closed: AtomicBool,
    stats: MemoryBackendStats,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired ones included until read or purged.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired record, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, stored| stored.expires_at > now);
        before - records.len()
    }

    pub fn stats(&self) -> &MemoryBackendStats {
        &self.stats
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalBackend for MemoryBackend {
    fn name(&self) -> &str {
        crate::config::MEMORY_PROVIDER
    }

    async fn get(&self, key: &str) -> Result<Option<ColdRecord>, BackendError> {
        self.ensure_open()?;
        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        {
            let records = self.records.read();
            match records.get(key) {
                None => return Ok(None),
                Some(stored) if stored.expires_at > now => {
                    let mut record = stored.record.clone();
                    record.remaining_ttl = Some(stored.expires_at - now);
                    return Ok(Some(record));
                }
                Some(_) => {}
            }
        }

        // Lazy expiry: re-check under the write lock, a concurrent set may have refreshed it.
        let mut records = self.records.write();
        if records.get(key).is_some_and(|stored| stored.expires_at <= now) {
            records.remove(key);
            debug!(key, "Expired cold record removed on read");
        }
        Ok(None)
    }

    async fn set(&self, key: &str, mut record: ColdRecord, ttl: Duration) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(record.payload.len() as u64, Ordering::Relaxed);

        record.remaining_ttl = None;
        let expires_at = Instant::now() + ttl;
        self.records
            .write()
            .insert(key.to_string(), StoredRecord { record, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.records.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.ensure_open()?;
        self.records.write().clear();
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<usize, BackendError> {
        self.ensure_open()?;
        Ok(self.purge_expired())
    }

    async fn close(&self) -> Result<(), BackendError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.records.write().clear();
            debug!("Memory backend closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: &'static [u8]) -> ColdRecord {
        ColdRecord {
            payload: Bytes::from_static(payload),
            compressed: false,
            tags: HashSet::new(),
            priority: Priority::Normal,
            remaining_ttl: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_and_read_record() {
        let backend = MemoryBackend::new();
        backend.set("k", record(b"42"), Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        let read = backend.get("k").await.unwrap().unwrap();
        assert_eq!(&read.payload[..], b"42");
        assert_eq!(read.remaining_ttl, Some(Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_expiry() {
        let backend = MemoryBackend::new();
        backend.set("k", record(b"1"), Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let backend = MemoryBackend::new();
        backend.set("short", record(b"1"), Duration::from_secs(1)).await.unwrap();
        backend.set("long", record(b"2"), Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(backend.purge_expired(), 1);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let backend = MemoryBackend::new();
        backend.delete("nothing").await.unwrap();
        backend.delete("nothing").await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_backend_rejects_calls() {
        let backend = MemoryBackend::new();
        backend.close().await.unwrap();
        backend.close().await.unwrap();

        assert!(matches!(backend.get("k").await, Err(BackendError::Closed)));
        assert!(matches!(
            backend.set("k", record(b"1"), Duration::from_secs(1)).await,
            Err(BackendError::Closed)
        ));
        assert!(matches!(backend.sweep_expired().await, Err(BackendError::Closed)));
    }
}
