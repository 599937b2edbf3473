//! Distributed snapshot engine
//!
//! Captures the state of a distributed application (nested state dicts of
//! primitives, opaque buffers, tensors and row-wise sharded values) into an
//! immutable snapshot on a storage backend, and restores it under the same
//! or a different world size.
//!
//! Entry points are [`Snapshot::take`], [`Snapshot::async_take`],
//! [`Snapshot::open`] and [`Snapshot::restore`]. Applications participate by
//! implementing [`Stateful`]; ranks coordinate through a [`ProcessGroup`]
//! and, for asynchronous commits, a shared [`KvStore`].

pub mod batcher;
pub mod chunker;
pub mod flatten;
pub mod manifest;
pub mod partitioner;
pub mod pg;
pub mod scheduler;
pub mod snapshot;
pub mod stateful;
pub mod store;

pub use manifest::{
    Chunk, ChunkedTensorEntry, DictEntry, Entry, Manifest, PrimitiveEntry, Shard, ShardedEntry,
    SnapshotMetadata, TensorEntry, SNAPSHOT_METADATA_PATH,
};
pub use pg::{LocalProcessGroup, ProcessGroup, SingleProcess};
pub use snapshot::{PendingSnapshot, Snapshot};
pub use stateful::{AppState, Stateful};
pub use store::{KvStore, LinearBarrier, MemoryKvStore};

pub use snapshot_core::{
    Dtype, Error, Result, ShardBuf, ShardedBuf, SnapshotConfig, StateDict, StateValue, TensorBuf,
    Value,
};
