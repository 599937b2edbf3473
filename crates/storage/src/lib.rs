//! Storage - Pluggable storage adapters for the snapshot engine
//!
//! Provides async, byte-range addressable storage with:
//! - Local filesystem adapter with atomic writes
//! - In-memory adapter for tests
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageAdapter, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> snapshot_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/snapshots");
//! storage.write("0/model/weight_0", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("0/model/weight_0", None).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;
mod memory;

pub use backend::StorageAdapter;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
