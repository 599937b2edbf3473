//! In-memory storage adapter
//!
//! Backs snapshot I/O with a concurrent map. Intended for tests and for
//! exercising the engine without touching the filesystem.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use snapshot_core::{ByteRange, Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::StorageAdapter;

/// In-memory storage adapter
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: DashMap<String, Bytes>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All stored paths, sorted
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Storage {
                message: "adapter is closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn read(&self, path: &str, range: Option<ByteRange>) -> Result<Bytes> {
        self.check_open()?;
        let data = self
            .objects
            .get(path)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })?;
        match range {
            None => Ok(data),
            Some(range) => {
                if range.end > data.len() as u64 {
                    return Err(Error::Storage {
                        message: format!(
                            "range [{}, {}) out of bounds for {} ({} bytes)",
                            range.start,
                            range.end,
                            path,
                            data.len()
                        ),
                    });
                }
                Ok(data.slice(range.start as usize..range.end as usize))
            }
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        self.check_open()?;
        let size = data.len() as u64;
        debug!(path, size, "Storing object in memory");
        self.objects.insert(path.to_string(), data);
        Ok(size)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_open()?;
        self.objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::StoragePathNotFound {
                path: path.to_string(),
            })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.objects.contains_key(path))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
