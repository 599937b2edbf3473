//! Snapshot capture and restore
//!
//! Ties the pipeline together: app state capture, flattening, replication
//! verification, chunk planning, write partitioning, budgeted I/O and the
//! commit protocol. [`Snapshot::take`] blocks until the snapshot is
//! committed; [`Snapshot::async_take`] returns as soon as the capture phase
//! is over and finishes the writes and the commit on a background thread.
//!
//! A snapshot is committed by writing its metadata object, exactly once, by
//! rank 0, after every rank's data writes have completed. Partially written
//! snapshot directories without a metadata object are not snapshots.

use crate::batcher::{batch_read_requests, batch_write_requests};
use crate::chunker::plan_chunks;
use crate::flatten::{flatten, inflate};
use crate::manifest::{
    get_available_entries, merge_rank_manifests, pattern_matches, split_rank_path, Chunk,
    ChunkedTensorEntry, Entry, Manifest, PrimitiveEntry, ShardedEntry, Shard, SnapshotMetadata,
    TensorEntry, SNAPSHOT_METADATA_PATH,
};
use crate::partitioner::{partition_replicated, ChunkingInstructions, PartitionAssignment};
use crate::pg::{all_gather_json, all_gather_object, broadcast_object, scatter_object, ProcessGroup};
use crate::scheduler::{execute_read_reqs, execute_write_reqs, ReadBuffer, ReadReq, WriteReq};
use crate::stateful::{rng_state_key, validate_app_state, AppState, Stateful};
use crate::store::{KvStore, LinearBarrier};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use snapshot_core::{
    num_elements, ByteRange, Dtype, Error, Result, ShardBuf, ShardedBuf, SnapshotConfig, StateDict,
    TensorBuf, Value,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use storage::StorageAdapter;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A committed snapshot, readable by any rank of any world size.
pub struct Snapshot {
    storage: Arc<dyn StorageAdapter>,
    metadata: SnapshotMetadata,
}

impl Snapshot {
    /// Capture `app_state` into a snapshot and block until it is committed.
    ///
    /// Every participating rank must call this collectively. Paths matching
    /// one of the `replicated` glob patterns on every rank are persisted
    /// once (with the write load spread across ranks) instead of once per
    /// rank, and stay restorable under a different world size.
    #[instrument(skip_all, fields(rank = pg.rank()))]
    pub fn take(
        app_state: &mut AppState<'_>,
        storage: Arc<dyn StorageAdapter>,
        pg: &dyn ProcessGroup,
        config: &SnapshotConfig,
        replicated: &[String],
    ) -> Result<Self> {
        let prep = take_impl(app_state, pg, config, replicated)?;
        let runtime = io_runtime()?;
        let rank = pg.rank();

        runtime.block_on(async {
            execute_write_reqs(
                prep.write_reqs,
                storage.clone(),
                config.memory_budget_bytes,
                rank,
            )
            .complete()
            .await
        })?;

        pg.barrier()?;
        if rank == 0 {
            let raw = prep.metadata.to_json()?;
            runtime.block_on(storage.write(SNAPSHOT_METADATA_PATH, Bytes::from(raw)))?;
            info!(world_size = pg.world_size(), "Snapshot committed");
        }
        pg.barrier()?;

        Ok(Self {
            storage,
            metadata: prep.metadata,
        })
    }

    /// Capture `app_state` and return while the writes and the commit run on
    /// a background thread.
    ///
    /// The capture phase is complete when this returns: the application may
    /// mutate its state freely afterwards. The commit is coordinated through
    /// `kv_store`, which must be shared by all participating ranks. The
    /// returned handle observes the outcome; dropping it without calling
    /// [`PendingSnapshot::wait`] detaches the commit, in which case failures
    /// are only logged.
    #[instrument(skip_all, fields(rank = pg.rank()))]
    pub fn async_take(
        app_state: &mut AppState<'_>,
        storage: Arc<dyn StorageAdapter>,
        pg: &dyn ProcessGroup,
        kv_store: Arc<dyn KvStore>,
        config: &SnapshotConfig,
        replicated: &[String],
    ) -> Result<PendingSnapshot> {
        let prep = take_impl(app_state, pg, config, replicated)?;
        let rank = pg.rank();
        let world_size = pg.world_size();

        // All ranks must wait on the same barrier prefix; snapshots may share
        // a store, so the prefix carries a per-snapshot id agreed up front.
        let commit_id = broadcast_object(
            pg,
            (rank == 0).then(|| Uuid::new_v4().to_string()).as_ref(),
            0,
        )?;
        let barrier = LinearBarrier::new(
            format!("commit/{}", commit_id),
            kv_store,
            rank,
            world_size,
            config.barrier_timeout,
        );

        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let thread_storage = storage.clone();
        let thread_metadata = prep.metadata.clone();
        let thread_done = done.clone();
        let memory_budget_bytes = config.memory_budget_bytes;
        let write_reqs = prep.write_reqs;

        let handle = std::thread::Builder::new()
            .name("snapshot-commit".to_string())
            .spawn(move || {
                let result = commit_in_background(
                    write_reqs,
                    thread_storage,
                    &thread_metadata,
                    &barrier,
                    memory_budget_bytes,
                    rank,
                );
                if let Err(e) = &result {
                    // Best effort: failing the barrier releases peers early
                    let _ = barrier.report_error(&e.to_string());
                    warn!(rank, error = %e, "Asynchronous snapshot failed");
                }
                thread_done.store(true, Ordering::Release);
                let _ = tx.send(result);
            })?;

        Ok(PendingSnapshot {
            storage,
            metadata: prep.metadata,
            done,
            rx,
            handle: Some(handle),
        })
    }

    /// Open a committed snapshot.
    ///
    /// Fails with [`Error::StoragePathNotFound`] when the metadata object is
    /// absent, which is also what a crashed, uncommitted take leaves behind.
    pub fn open(storage: Arc<dyn StorageAdapter>) -> Result<Self> {
        let runtime = io_runtime()?;
        let raw = runtime.block_on(storage.read(SNAPSHOT_METADATA_PATH, None))?;
        let text = std::str::from_utf8(&raw)
            .map_err(|e| Error::Serialization(format!("metadata is not valid UTF-8: {e}")))?;
        let metadata = SnapshotMetadata::from_json(text)?;
        debug!(
            world_size = metadata.world_size,
            entries = metadata.manifest.len(),
            "Opened snapshot"
        );
        Ok(Self { storage, metadata })
    }

    /// Restore `app_state` from this snapshot.
    ///
    /// Collective over the calling world, which need not match the world
    /// that took the snapshot: replicated and sharded entries restore under
    /// any world size.
    #[instrument(skip_all, fields(rank = pg.rank()))]
    pub fn restore(
        &self,
        app_state: &mut AppState<'_>,
        pg: &dyn ProcessGroup,
        config: &SnapshotConfig,
    ) -> Result<()> {
        validate_app_state(app_state)?;
        let rank = pg.rank();
        let rng_key = rng_state_key(app_state);
        let global_keys = gather_global_keys(app_state, pg)?;
        let available = get_available_entries(&self.metadata.manifest, rank)?;
        let runtime = io_runtime()?;

        for key in &global_keys {
            if Some(key) != rng_key.as_ref() {
                if let Some(stateful) = app_state.get_mut(key) {
                    self.load_stateful(key, *stateful, &available, config, rank, &runtime)?;
                }
            }
            // Keeps ranks aligned even when keys are unevenly distributed
            pg.barrier()?;
        }

        // RNG state last, so restoring other components cannot disturb it
        if let Some(key) = rng_key {
            if let Some(stateful) = app_state.get_mut(&key) {
                self.load_stateful(&key, *stateful, &available, config, rank, &runtime)?;
            }
        }
        Ok(())
    }

    /// Read a single persisted value without going through app state.
    ///
    /// `path` is a full manifest path including the rank prefix, e.g.
    /// `0/model/weight`. Sharded values are assembled into one full tensor;
    /// container paths are not readable.
    pub fn read_object(&self, path: &str, config: &SnapshotConfig) -> Result<Value> {
        let (rank, logical) = split_rank_path(path)?;
        let available = get_available_entries(&self.metadata.manifest, rank)?;
        let entry = available.get(logical).ok_or_else(|| Error::PathUnavailable {
            path: path.to_string(),
            rank,
            message: self.unavailable_reason(logical),
        })?;
        if matches!(entry, Entry::Dict(_)) {
            return Err(Error::Validation {
                message: format!("\"{}\" is a container, not a value", path),
            });
        }

        let mut read_reqs = Vec::new();
        let staged = stage_entry(logical, entry, None, &mut read_reqs)?
            .ok_or_else(|| Error::Validation {
                message: format!("\"{}\" has no readable value", path),
            })?;
        let runtime = io_runtime()?;
        runtime.block_on(async {
            execute_read_reqs(
                read_reqs,
                self.storage.clone(),
                config.memory_budget_bytes,
                rank,
            )
            .complete()
            .await
        })?;
        finish_staged(staged)
    }

    /// The metadata this snapshot was committed with.
    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// The global manifest, keyed by `rank/logicalPath`.
    pub fn manifest(&self) -> &Manifest {
        &self.metadata.manifest
    }

    fn load_stateful(
        &self,
        key: &str,
        stateful: &mut dyn Stateful,
        available: &Manifest,
        config: &SnapshotConfig,
        rank: usize,
        runtime: &tokio::runtime::Runtime,
    ) -> Result<()> {
        let child_prefix = format!("{}/", key);
        let entries: Manifest = available
            .iter()
            .filter(|(path, _)| *path == key || path.starts_with(&child_prefix))
            .map(|(path, entry)| (path.clone(), entry.clone()))
            .collect();
        if entries.is_empty() {
            return Err(Error::PathUnavailable {
                path: key.to_string(),
                rank,
                message: self.unavailable_reason(key),
            });
        }

        // The live state dict disambiguates entries whose persisted form is
        // not self-describing (opaque buffers, local shard layouts)
        let expected = flatten(&stateful.state_dict()?, key).1;

        // Container entries are visible to every rank, so a populated
        // `entries` does not prove the leaves are. Every value the live
        // state expects must be readable from this rank's view.
        for path in expected.keys() {
            if !entries.contains_key(path) {
                return Err(Error::PathUnavailable {
                    path: path.clone(),
                    rank,
                    message: self.unavailable_reason(path),
                });
            }
        }

        let mut staged = BTreeMap::new();
        let mut read_reqs = Vec::new();
        for (path, entry) in &entries {
            if let Some(s) = stage_entry(path, entry, expected.get(path), &mut read_reqs)? {
                staged.insert(path.clone(), s);
            }
        }
        if config.enable_batching {
            read_reqs = batch_read_requests(read_reqs);
        }
        runtime.block_on(async {
            execute_read_reqs(
                read_reqs,
                self.storage.clone(),
                config.memory_budget_bytes,
                rank,
            )
            .complete()
            .await
        })?;

        let mut flattened = BTreeMap::new();
        for (path, s) in staged {
            flattened.insert(path, finish_staged(s)?);
        }
        let state_dict = inflate(&entries, &flattened, key)?;
        stateful.load_state_dict(state_dict)
    }

    fn unavailable_reason(&self, logical: &str) -> String {
        let child_prefix = format!("{}/", logical);
        let persisted_elsewhere = self.metadata.manifest.keys().any(|path| {
            split_rank_path(path)
                .map(|(_, l)| l == logical || l.starts_with(&child_prefix))
                .unwrap_or(false)
        });
        if persisted_elsewhere {
            "The entry exists in the snapshot but belongs to a different rank and is neither \
             replicated nor sharded. Mark values that must survive a world size change as \
             replicated, or shard them."
                .to_string()
        } else {
            "The entry does not exist in this snapshot.".to_string()
        }
    }
}

/// Handle to a snapshot whose writes and commit are still in flight.
pub struct PendingSnapshot {
    storage: Arc<dyn StorageAdapter>,
    metadata: SnapshotMetadata,
    done: Arc<AtomicBool>,
    rx: mpsc::Receiver<Result<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PendingSnapshot {
    /// Whether the background commit has finished (successfully or not).
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Block until the commit finishes and return the committed snapshot.
    pub fn wait(mut self) -> Result<Snapshot> {
        let result = self.rx.recv().map_err(|_| Error::ChannelClosed {
            channel: "snapshot commit".to_string(),
        });
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        result??;
        Ok(Snapshot {
            storage: self.storage,
            metadata: self.metadata,
        })
    }
}

fn commit_in_background(
    write_reqs: Vec<WriteReq>,
    storage: Arc<dyn StorageAdapter>,
    metadata: &SnapshotMetadata,
    barrier: &LinearBarrier,
    memory_budget_bytes: u64,
    rank: usize,
) -> Result<()> {
    let runtime = io_runtime()?;
    runtime.block_on(async {
        execute_write_reqs(write_reqs, storage.clone(), memory_budget_bytes, rank)
            .complete()
            .await
    })?;
    barrier.arrive()?;
    if barrier.is_leader() {
        let raw = metadata.to_json()?;
        runtime.block_on(storage.write(SNAPSHOT_METADATA_PATH, Bytes::from(raw)))?;
        info!(world_size = metadata.world_size, "Snapshot committed");
    }
    barrier.depart()
}

struct TakePrep {
    metadata: SnapshotMetadata,
    write_reqs: Vec<WriteReq>,
}

/// The synchronous capture phase shared by `take` and `async_take`.
///
/// When this returns, the app state has been fully captured and may be
/// mutated by the application; only the returned write requests and the
/// commit remain.
fn take_impl(
    app_state: &mut AppState<'_>,
    pg: &dyn ProcessGroup,
    config: &SnapshotConfig,
    replicated: &[String],
) -> Result<TakePrep> {
    validate_app_state(app_state)?;
    let rank = pg.rank();
    let world_size = pg.world_size();

    // RNG state is captured before any other component runs and reloaded
    // after collection, so no other capture can perturb what gets persisted
    // and the random stream continues as if the snapshot never happened.
    let rng_key = rng_state_key(app_state);
    let rng_state = match &rng_key {
        Some(key) => match app_state.get(key) {
            Some(stateful) => Some(stateful.state_dict()?),
            None => None,
        },
        None => None,
    };

    let global_keys = gather_global_keys(app_state, pg)?;
    let mut fragment = Manifest::new();
    let mut flattened: BTreeMap<String, Value> = BTreeMap::new();
    // One barrier per key, including keys this rank does not hold, keeps
    // any collectives issued inside state_dict() aligned across ranks.
    for key in &global_keys {
        if let Some(stateful) = app_state.get(key) {
            let state_dict = match (&rng_key, &rng_state) {
                (Some(rng), Some(state)) if rng == key => state.clone(),
                _ => stateful.state_dict()?,
            };
            let (key_manifest, key_flattened) = flatten(&state_dict, key);
            fragment.extend(key_manifest);
            flattened.extend(key_flattened);
        }
        pg.barrier()?;
    }
    if let (Some(key), Some(state)) = (&rng_key, rng_state) {
        if let Some(stateful) = app_state.get_mut(key) {
            stateful.load_state_dict(state)?;
        }
    }

    // Verify replication: a path is replicated only when every rank has it
    // and asked for it
    let verified = verify_replicated_paths(&flattened, replicated, pg)?;

    // Plan chunks for large plain tensors and partition the replicated
    // write load across ranks. The partition is computed on rank 0 and
    // scattered so all ranks act on one decision.
    let mut chunking = ChunkingInstructions::new();
    for (path, value) in &flattened {
        if let Value::Tensor(tensor) = value {
            let chunks = plan_chunks(tensor, config.max_chunk_size_bytes);
            if chunks.len() > 1 {
                chunking.insert(path.clone(), chunks);
            }
        }
    }
    let assignment = if world_size > 1 {
        let assignments = (rank == 0).then(|| {
            let paths: Vec<String> = verified.iter().cloned().collect();
            partition_replicated(&paths, &chunking, world_size)
        });
        scatter_object(pg, assignments, 0)?
    } else {
        let paths: Vec<String> = verified.iter().cloned().collect();
        partition_replicated(&paths, &chunking, 1).pop().unwrap_or_default()
    };

    let mut write_reqs = Vec::new();
    for (path, value) in &flattened {
        plan_value(
            path,
            value,
            verified.contains(path),
            &assignment,
            chunking.get(path),
            rank,
            &mut fragment,
            &mut write_reqs,
        )?;
    }
    if config.enable_batching {
        write_reqs =
            batch_write_requests(&mut fragment, write_reqs, config.batch_threshold_bytes, rank);
    }
    debug!(
        rank,
        entries = fragment.len(),
        write_requests = write_reqs.len(),
        "Prepared manifest fragment"
    );

    // JSON on the wire: manifests carry arbitrary primitive values
    let fragments = all_gather_json(pg, &fragment)?;
    let manifest = merge_rank_manifests(&fragments)?;

    Ok(TakePrep {
        metadata: SnapshotMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            world_size,
            created_at: Utc::now(),
            manifest,
        },
        write_reqs,
    })
}

/// Sorted union of every rank's app state keys, so all ranks traverse the
/// same key sequence.
fn gather_global_keys(app_state: &AppState<'_>, pg: &dyn ProcessGroup) -> Result<Vec<String>> {
    let local: Vec<String> = app_state.keys().cloned().collect();
    let gathered = all_gather_object(pg, &local)?;
    let union: BTreeSet<String> = gathered.into_iter().flatten().collect();
    Ok(union.into_iter().collect())
}

/// Paths matching a replication pattern that every rank reported.
fn verify_replicated_paths(
    flattened: &BTreeMap<String, Value>,
    patterns: &[String],
    pg: &dyn ProcessGroup,
) -> Result<BTreeSet<String>> {
    // Always run the collectives: ranks may pass different pattern lists
    // (a pattern not supplied by every rank verifies nothing), and skipping
    // a round would desynchronize the collective sequence.
    let candidates: Vec<String> = flattened
        .iter()
        .filter(|(path, value)| {
            // Sharded values have per-rank content; a matching pattern is a no-op
            !matches!(value, Value::Sharded(_))
                && patterns.iter().any(|p| pattern_matches(p, path))
        })
        .map(|(path, _)| path.clone())
        .collect();

    let gathered = all_gather_object(pg, &candidates)?;
    let world_size = pg.world_size();
    let verified = (pg.rank() == 0).then(|| {
        let mut counts: HashMap<&String, usize> = HashMap::new();
        for path in gathered.iter().flatten() {
            *counts.entry(path).or_default() += 1;
        }
        let mut verified: Vec<String> = counts
            .into_iter()
            .filter(|(_, count)| *count == world_size)
            .map(|(path, _)| path.clone())
            .collect();
        verified.sort();
        verified
    });
    let verified: Vec<String> = broadcast_object(pg, verified.as_ref(), 0)?;
    Ok(verified.into_iter().collect())
}

fn tensor_location(rank: usize, path: &str) -> String {
    format!("{}/{}", rank, path)
}

fn chunk_location(rank: usize, path: &str, chunk: &Chunk) -> String {
    format!("{}/{}_{}", rank, path, chunk.offsets.first().copied().unwrap_or(0))
}

fn shard_location(rank: usize, path: &str, row_offset: u64) -> String {
    format!("{}/{}.shard.{}", rank, path, row_offset)
}

/// Emit the manifest entry and write requests for one captured value.
///
/// Replicated values are only emitted by the ranks the partition assigned;
/// the manifest merge injects the combined entry under every rank prefix.
#[allow(clippy::too_many_arguments)]
fn plan_value(
    path: &str,
    value: &Value,
    replicated: bool,
    assignment: &PartitionAssignment,
    chunks: Option<&Vec<Chunk>>,
    rank: usize,
    fragment: &mut Manifest,
    write_reqs: &mut Vec<WriteReq>,
) -> Result<()> {
    let assigned_nonchunked =
        !replicated || assignment.paths.iter().any(|p| p == path);
    match value {
        Value::Primitive(v) => {
            if assigned_nonchunked {
                fragment.insert(
                    path.to_string(),
                    Entry::Primitive(PrimitiveEntry {
                        value: v.clone(),
                        replicated,
                    }),
                );
            }
        }
        Value::Bytes(data) => {
            if assigned_nonchunked {
                let location = tensor_location(rank, path);
                fragment.insert(
                    path.to_string(),
                    Entry::Tensor(TensorEntry {
                        location: location.clone(),
                        dtype: Dtype::U8,
                        shape: vec![data.len() as u64],
                        byte_range: None,
                        replicated,
                    }),
                );
                write_reqs.push(WriteReq {
                    path: location,
                    buf: data.clone(),
                });
            }
        }
        Value::Tensor(tensor) => match chunks {
            // Multi-chunk tensor; replicated ones carry only this rank's
            // assigned chunks
            Some(planned) => {
                let mine: Vec<Chunk> = if replicated {
                    assignment
                        .chunking
                        .get(path)
                        .map(|chunks| chunks.clone())
                        .unwrap_or_default()
                } else {
                    planned.clone()
                };
                if mine.is_empty() {
                    return Ok(());
                }
                let row_bytes = tensor.row_bytes();
                let mut located = Vec::with_capacity(mine.len());
                for chunk in mine {
                    let location = chunk_location(rank, path, &chunk);
                    let start =
                        (chunk.offsets.first().copied().unwrap_or(0) * row_bytes) as usize;
                    let end = start + chunk.num_bytes() as usize;
                    write_reqs.push(WriteReq {
                        path: location.clone(),
                        buf: tensor.data.slice(start..end),
                    });
                    located.push(Chunk { location, ..chunk });
                }
                fragment.insert(
                    path.to_string(),
                    Entry::ChunkedTensor(ChunkedTensorEntry {
                        dtype: tensor.dtype,
                        shape: tensor.shape.clone(),
                        chunks: located,
                        replicated,
                    }),
                );
            }
            // Fits in one object (or holds no rows at all)
            None => {
                if assigned_nonchunked {
                    let location = tensor_location(rank, path);
                    fragment.insert(
                        path.to_string(),
                        Entry::Tensor(TensorEntry {
                            location: location.clone(),
                            dtype: tensor.dtype,
                            shape: tensor.shape.clone(),
                            byte_range: None,
                            replicated,
                        }),
                    );
                    write_reqs.push(WriteReq {
                        path: location,
                        buf: tensor.data.clone(),
                    });
                }
            }
        },
        Value::Sharded(sharded) => {
            let mut shards = Vec::with_capacity(sharded.shards.len());
            for shard in &sharded.shards {
                check_row_wise(path, &sharded.shape, &shard.sizes)?;
                let expected = num_elements(&shard.sizes) * sharded.dtype.element_size_bytes();
                if shard.data.len() as u64 != expected {
                    return Err(Error::Validation {
                        message: format!(
                            "shard of \"{}\" has {} bytes, sizes {:?} require {}",
                            path,
                            shard.data.len(),
                            shard.sizes,
                            expected
                        ),
                    });
                }
                let row_offset = shard.offsets.first().copied().unwrap_or(0);
                let location = shard_location(rank, path, row_offset);
                write_reqs.push(WriteReq {
                    path: location.clone(),
                    buf: shard.data.clone(),
                });
                shards.push(Shard {
                    offsets: shard.offsets.clone(),
                    sizes: shard.sizes.clone(),
                    location,
                    byte_range: None,
                });
            }
            fragment.insert(
                path.to_string(),
                Entry::Sharded(ShardedEntry {
                    dtype: sharded.dtype,
                    shape: sharded.shape.clone(),
                    shards,
                }),
            );
        }
    }
    Ok(())
}

fn check_row_wise(path: &str, shape: &[u64], sizes: &[u64]) -> Result<()> {
    if sizes.len() != shape.len() || sizes.get(1..) != shape.get(1..) {
        return Err(Error::Validation {
            message: format!(
                "shard of \"{}\" with sizes {:?} is not a row range of shape {:?}; only \
                 outermost-dimension sharding is supported",
                path, sizes, shape
            ),
        });
    }
    Ok(())
}

fn row_bytes_of(shape: &[u64], dtype: Dtype) -> u64 {
    let inner: u64 = shape.iter().skip(1).product();
    inner.max(1) * dtype.element_size_bytes()
}

fn staging_buffer(num_bytes: u64) -> ReadBuffer {
    Arc::new(Mutex::new(vec![0u8; num_bytes as usize]))
}

fn take_staged_bytes(buf: ReadBuffer) -> Bytes {
    match Arc::try_unwrap(buf) {
        Ok(inner) => Bytes::from(inner.into_inner()),
        Err(shared) => Bytes::from(shared.lock().clone()),
    }
}

struct StagedShard {
    offsets: Vec<u64>,
    sizes: Vec<u64>,
    buf: ReadBuffer,
}

/// A value mid-restore: either already known or waiting for read requests to
/// fill its staging buffers.
enum Staged {
    Ready(Value),
    Bytes(ReadBuffer),
    Tensor {
        dtype: Dtype,
        shape: Vec<u64>,
        buf: ReadBuffer,
    },
    Sharded {
        dtype: Dtype,
        shape: Vec<u64>,
        shards: Vec<StagedShard>,
    },
}

/// Stage one manifest entry for reading, appending its read requests.
///
/// `expected` is the live value the restore will overwrite, when there is
/// one. It distinguishes opaque byte buffers from genuine u8 tensors and
/// supplies the local shard layout for sharded values; without it, sharded
/// values materialize as one full tensor.
fn stage_entry(
    path: &str,
    entry: &Entry,
    expected: Option<&Value>,
    read_reqs: &mut Vec<ReadReq>,
) -> Result<Option<Staged>> {
    match entry {
        Entry::Dict(_) => Ok(None),
        Entry::Primitive(pe) => Ok(Some(Staged::Ready(Value::Primitive(pe.value.clone())))),
        Entry::Tensor(te) => {
            let num_bytes = num_elements(&te.shape) * te.dtype.element_size_bytes();
            let buf = staging_buffer(num_bytes);
            if num_bytes > 0 {
                read_reqs.push(ReadReq::single(
                    te.location.clone(),
                    te.byte_range,
                    num_bytes,
                    buf.clone(),
                    0,
                ));
            }
            if matches!(expected, Some(Value::Bytes(_))) {
                Ok(Some(Staged::Bytes(buf)))
            } else {
                Ok(Some(Staged::Tensor {
                    dtype: te.dtype,
                    shape: te.shape.clone(),
                    buf,
                }))
            }
        }
        Entry::ChunkedTensor(ce) => {
            let num_bytes = num_elements(&ce.shape) * ce.dtype.element_size_bytes();
            let buf = staging_buffer(num_bytes);
            let row_bytes = row_bytes_of(&ce.shape, ce.dtype);
            for chunk in &ce.chunks {
                read_reqs.push(ReadReq::single(
                    chunk.location.clone(),
                    chunk.byte_range,
                    chunk.num_bytes(),
                    buf.clone(),
                    chunk.offsets.first().copied().unwrap_or(0) * row_bytes,
                ));
            }
            Ok(Some(Staged::Tensor {
                dtype: ce.dtype,
                shape: ce.shape.clone(),
                buf,
            }))
        }
        Entry::Sharded(se) => {
            let row_bytes = row_bytes_of(&se.shape, se.dtype);
            match expected {
                Some(Value::Sharded(live)) => {
                    let mut shards = Vec::with_capacity(live.shards.len());
                    for shard in &live.shards {
                        check_row_wise(path, &se.shape, &shard.sizes)?;
                        let num_bytes =
                            num_elements(&shard.sizes) * se.dtype.element_size_bytes();
                        let buf = staging_buffer(num_bytes);
                        stage_shard_overlaps(
                            se,
                            shard.offsets.first().copied().unwrap_or(0),
                            shard.sizes.first().copied().unwrap_or(0),
                            row_bytes,
                            &buf,
                            read_reqs,
                        );
                        shards.push(StagedShard {
                            offsets: shard.offsets.clone(),
                            sizes: shard.sizes.clone(),
                            buf,
                        });
                    }
                    Ok(Some(Staged::Sharded {
                        dtype: se.dtype,
                        shape: se.shape.clone(),
                        shards,
                    }))
                }
                // No local layout to honor: assemble the full value
                _ => {
                    let num_bytes = num_elements(&se.shape) * se.dtype.element_size_bytes();
                    let buf = staging_buffer(num_bytes);
                    stage_shard_overlaps(
                        se,
                        0,
                        se.shape.first().copied().unwrap_or(0),
                        row_bytes,
                        &buf,
                        read_reqs,
                    );
                    Ok(Some(Staged::Tensor {
                        dtype: se.dtype,
                        shape: se.shape.clone(),
                        buf,
                    }))
                }
            }
        }
    }
}

/// Emit the read requests that fill rows `[row_offset, row_offset + rows)`
/// of `buf` from the persisted shards overlapping that range.
fn stage_shard_overlaps(
    se: &ShardedEntry,
    row_offset: u64,
    rows: u64,
    row_bytes: u64,
    buf: &ReadBuffer,
    read_reqs: &mut Vec<ReadReq>,
) {
    for persisted in &se.shards {
        let p_start = persisted.offsets.first().copied().unwrap_or(0);
        let p_rows = persisted.sizes.first().copied().unwrap_or(0);
        let start = row_offset.max(p_start);
        let end = (row_offset + rows).min(p_start + p_rows);
        if start >= end {
            continue;
        }
        let within = ByteRange::new((start - p_start) * row_bytes, (end - p_start) * row_bytes);
        // Shards absorbed into a batched blob sit at an inner offset
        let range = match persisted.byte_range {
            Some(outer) => ByteRange::new(outer.start + within.start, outer.start + within.end),
            None => within,
        };
        read_reqs.push(ReadReq::single(
            persisted.location.clone(),
            Some(range),
            range.len(),
            buf.clone(),
            (start - row_offset) * row_bytes,
        ));
    }
}

/// Turn a staged value into its final form once its reads completed.
fn finish_staged(staged: Staged) -> Result<Value> {
    match staged {
        Staged::Ready(value) => Ok(value),
        Staged::Bytes(buf) => Ok(Value::Bytes(take_staged_bytes(buf))),
        Staged::Tensor { dtype, shape, buf } => Ok(Value::Tensor(TensorBuf::new(
            dtype,
            shape,
            take_staged_bytes(buf),
        )?)),
        Staged::Sharded {
            dtype,
            shape,
            shards,
        } => {
            let shards = shards
                .into_iter()
                .map(|shard| ShardBuf {
                    offsets: shard.offsets,
                    sizes: shard.sizes,
                    data: take_staged_bytes(shard.buf),
                })
                .collect();
            Ok(Value::Sharded(ShardedBuf {
                dtype,
                shape,
                shards,
            }))
        }
    }
}

fn io_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
