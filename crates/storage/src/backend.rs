//! Storage adapter trait definition
//!
//! Defines the async interface the snapshot engine consumes for persisting
//! and retrieving byte buffers.

use async_trait::async_trait;
use bytes::Bytes;
use snapshot_core::{ByteRange, Result};

/// Async trait for storage adapters
///
/// Implementors provide byte-range addressable storage for snapshot data.
/// The engine treats adapter failures opaquely: an error aborts the current
/// scheduler batch and is propagated to the caller without interpretation.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Read data from the given path
    ///
    /// When `range` is supplied, only the bytes in `[range.start, range.end)`
    /// are returned.
    ///
    /// # Errors
    /// Returns error if the path doesn't exist, the range is out of bounds,
    /// or the read fails.
    async fn read(&self, path: &str, range: Option<ByteRange>) -> Result<Bytes>;

    /// Write data to the given path
    ///
    /// Creates parent locations if they don't exist. Uses atomic writes where
    /// possible (write to temp, then rename).
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete data at the given path
    ///
    /// # Errors
    /// Returns error if the path doesn't exist or deletion fails.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Release any resources held by the adapter
    ///
    /// Called once per snapshot operation after all reads/writes complete.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
