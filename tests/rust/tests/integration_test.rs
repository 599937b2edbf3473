//! Multi-rank snapshot integration tests
//!
//! Ranks run as threads of one process connected by a `LocalProcessGroup`,
//! sharing one storage adapter the way real ranks share a distributed
//! filesystem. Covers synchronous and asynchronous takes, request batching
//! and abort-on-failure of the two-phase commit.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use snapshot::{
    AppState, Entry, KvStore, LocalProcessGroup, Manifest, MemoryKvStore, ProcessGroup, Snapshot,
    Stateful,
};
use snapshot_core::{
    num_elements, ByteRange, Dtype, Error, ShardBuf, ShardedBuf, SnapshotConfig, StateDict,
    StateValue, TensorBuf, Value,
};
use std::sync::Arc;
use std::thread;
use storage::{LocalStorage, MemoryStorage, StorageAdapter};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Component {
    state: StateDict,
}

impl Component {
    fn new(state: StateDict) -> Self {
        Self { state }
    }
}

impl Stateful for Component {
    fn state_dict(&self) -> snapshot_core::Result<StateDict> {
        Ok(self.state.clone())
    }

    fn load_state_dict(&mut self, state_dict: StateDict) -> snapshot_core::Result<()> {
        self.state = state_dict;
        Ok(())
    }
}

fn leaf(value: Value) -> StateValue {
    StateValue::Leaf(value)
}

fn seeded_bytes(len: usize, seed: u64) -> Bytes {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    Bytes::from((0..len).map(|_| rng.gen()).collect::<Vec<u8>>())
}

fn seeded_tensor(dtype: Dtype, shape: Vec<u64>, seed: u64) -> Value {
    let len = (num_elements(&shape) * dtype.element_size_bytes()) as usize;
    Value::Tensor(TensorBuf::new(dtype, shape, seeded_bytes(len, seed)).unwrap())
}

/// Identical on every rank; saved once thanks to the `model/**` pattern.
fn model_state() -> StateDict {
    let mut state = StateDict::new();
    state.insert("weight".to_string(), leaf(seeded_tensor(Dtype::F32, vec![16, 8], 7)));
    state.insert("bias".to_string(), leaf(seeded_tensor(Dtype::F32, vec![16], 8)));
    state
}

/// Rank-local values.
fn trainer_state(rank: usize) -> StateDict {
    let mut state = StateDict::new();
    state.insert(
        "step".to_string(),
        leaf(Value::Primitive(serde_json::json!(rank * 100 + 5))),
    );
    state.insert(
        "opaque".to_string(),
        leaf(Value::Bytes(seeded_bytes(64, 100 + rank as u64))),
    );
    state.insert(
        "momentum".to_string(),
        leaf(seeded_tensor(Dtype::F64, vec![4, 4], 200 + rank as u64)),
    );
    state
}

const TABLE_ROWS: u64 = 8;
const TABLE_COLS: u64 = 4;

fn full_table_data() -> Bytes {
    seeded_bytes((TABLE_ROWS * TABLE_COLS * 4) as usize, 11)
}

/// Each rank owns a contiguous row range of one global table.
fn table_state(rank: usize, world_size: usize) -> StateDict {
    let rows = TABLE_ROWS / world_size as u64;
    let row_bytes = (TABLE_COLS * 4) as usize;
    let offset = rank as u64 * rows;
    let data = full_table_data()
        .slice(offset as usize * row_bytes..(offset + rows) as usize * row_bytes);

    let mut state = StateDict::new();
    state.insert(
        "embeddings".to_string(),
        leaf(Value::Sharded(ShardedBuf {
            dtype: Dtype::F32,
            shape: vec![TABLE_ROWS, TABLE_COLS],
            shards: vec![ShardBuf {
                offsets: vec![offset, 0],
                sizes: vec![rows, TABLE_COLS],
                data,
            }],
        })),
    );
    state
}

fn blank_like(state: &StateDict) -> StateDict {
    state
        .iter()
        .map(|(key, value)| {
            let blanked = match value {
                StateValue::Dict(nested) => StateValue::Dict(blank_like(nested)),
                StateValue::Leaf(Value::Primitive(_)) => {
                    leaf(Value::Primitive(serde_json::Value::Null))
                }
                StateValue::Leaf(Value::Bytes(_)) => leaf(Value::Bytes(Bytes::new())),
                StateValue::Leaf(Value::Tensor(t)) => leaf(Value::Tensor(
                    TensorBuf::new(t.dtype, t.shape.clone(), Bytes::from(vec![0u8; t.data.len()]))
                        .unwrap(),
                )),
                StateValue::Leaf(Value::Sharded(s)) => {
                    let shards = s
                        .shards
                        .iter()
                        .map(|shard| ShardBuf {
                            offsets: shard.offsets.clone(),
                            sizes: shard.sizes.clone(),
                            data: Bytes::from(vec![0u8; shard.data.len()]),
                        })
                        .collect();
                    leaf(Value::Sharded(ShardedBuf {
                        dtype: s.dtype,
                        shape: s.shape.clone(),
                        shards,
                    }))
                }
            };
            (key.clone(), blanked)
        })
        .collect()
}

fn replicated_patterns() -> Vec<String> {
    vec!["model/**".to_string()]
}

/// Run one closure per rank on its own thread; panics if any rank fails.
fn run_world<T, F>(world_size: usize, f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(LocalProcessGroup) -> Result<T> + Send + Sync + 'static,
{
    run_world_results(world_size, f)
        .into_iter()
        .enumerate()
        .map(|(rank, result)| result.unwrap_or_else(|e| panic!("rank {} failed: {:#}", rank, e)))
        .collect()
}

fn run_world_results<T, F>(world_size: usize, f: F) -> Vec<Result<T>>
where
    T: Send + 'static,
    F: Fn(LocalProcessGroup) -> Result<T> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = LocalProcessGroup::create(world_size)
        .into_iter()
        .map(|pg| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(pg))
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("rank panicked"))
        .collect()
}

fn take_to(
    storage: Arc<dyn StorageAdapter>,
    pg: &dyn ProcessGroup,
    config: &SnapshotConfig,
) -> Result<Snapshot> {
    let rank = pg.rank();
    let world_size = pg.world_size();
    let mut model = Component::new(model_state());
    let mut trainer = Component::new(trainer_state(rank));
    let mut table = Component::new(table_state(rank, world_size));
    let mut app_state = AppState::new();
    app_state.insert("model".to_string(), &mut model as &mut dyn Stateful);
    app_state.insert("trainer".to_string(), &mut trainer as &mut dyn Stateful);
    app_state.insert("table".to_string(), &mut table as &mut dyn Stateful);
    Ok(Snapshot::take(
        &mut app_state,
        storage,
        pg,
        config,
        &replicated_patterns(),
    )?)
}

fn restore_and_check(snapshot: &Snapshot, pg: &dyn ProcessGroup, config: &SnapshotConfig) -> Result<()> {
    let rank = pg.rank();
    let world_size = pg.world_size();
    let mut model = Component::new(blank_like(&model_state()));
    let mut trainer = Component::new(blank_like(&trainer_state(rank)));
    let mut table = Component::new(blank_like(&table_state(rank, world_size)));
    let mut app_state = AppState::new();
    app_state.insert("model".to_string(), &mut model as &mut dyn Stateful);
    app_state.insert("trainer".to_string(), &mut trainer as &mut dyn Stateful);
    app_state.insert("table".to_string(), &mut table as &mut dyn Stateful);
    snapshot.restore(&mut app_state, pg, config)?;
    drop(app_state);

    anyhow::ensure!(model.state == model_state(), "model state differs on rank {rank}");
    anyhow::ensure!(trainer.state == trainer_state(rank), "trainer state differs on rank {rank}");
    anyhow::ensure!(
        table.state == table_state(rank, world_size),
        "table state differs on rank {rank}"
    );
    Ok(())
}

#[test]
fn test_multi_rank_take_restore_round_trip() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn StorageAdapter> = Arc::new(LocalStorage::new(dir.path()));
    let config = SnapshotConfig::default();

    let manifests = run_world(2, move |pg| {
        let snapshot = take_to(storage.clone(), &pg, &config)?;
        restore_and_check(&snapshot, &pg, &config)?;
        Ok(snapshot.manifest().clone())
    });

    // Every rank ends up with the same global manifest
    assert_eq!(manifests[0], manifests[1]);
    let manifest = &manifests[0];

    // Per-rank values stay distinct
    let step = |rank: usize| match &manifest[&format!("{}/trainer/step", rank)] {
        Entry::Primitive(pe) => pe.value.clone(),
        other => panic!("expected primitive, got {:?}", other),
    };
    assert_eq!(step(0), serde_json::json!(5));
    assert_eq!(step(1), serde_json::json!(105));

    // The replicated model entry is injected under both rank prefixes and
    // points at a single persisted copy
    let weight0 = &manifest["0/model/weight"];
    let weight1 = &manifest["1/model/weight"];
    assert!(weight0.is_replicated());
    assert_eq!(weight0, weight1);

    // Each rank's shard of the table is recorded under its own prefix
    for rank in 0..2 {
        match &manifest[&format!("{}/table/embeddings", rank)] {
            Entry::Sharded(se) => {
                assert_eq!(se.shape, vec![TABLE_ROWS, TABLE_COLS]);
                assert_eq!(se.shards.len(), 1);
                assert_eq!(se.shards[0].offsets, vec![rank as u64 * 4, 0]);
            }
            other => panic!("expected sharded entry, got {:?}", other),
        }
    }
}

#[test]
fn test_sync_and_async_takes_produce_identical_manifests() {
    init_tracing();
    let sync_storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
    let async_storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let config = SnapshotConfig::default();

    let manifests: Vec<(Manifest, Manifest)> = run_world(2, move |pg| {
        let rank = pg.rank();
        let sync_snapshot = take_to(sync_storage.clone(), &pg, &config)?;

        let mut model = Component::new(model_state());
        let mut trainer = Component::new(trainer_state(rank));
        let mut table = Component::new(table_state(rank, 2));
        let mut app_state = AppState::new();
        app_state.insert("model".to_string(), &mut model as &mut dyn Stateful);
        app_state.insert("trainer".to_string(), &mut trainer as &mut dyn Stateful);
        app_state.insert("table".to_string(), &mut table as &mut dyn Stateful);
        let pending = Snapshot::async_take(
            &mut app_state,
            async_storage.clone(),
            &pg,
            kv.clone(),
            &config,
            &replicated_patterns(),
        )?;
        let async_snapshot = pending.wait()?;
        restore_and_check(&async_snapshot, &pg, &config)?;

        Ok((sync_snapshot.manifest().clone(), async_snapshot.manifest().clone()))
    });

    for (sync_manifest, async_manifest) in manifests {
        assert_eq!(sync_manifest, async_manifest);
    }
}

#[test]
fn test_batching_preserves_restored_state() {
    init_tracing();
    let storage = Arc::new(MemoryStorage::new());
    let config = SnapshotConfig {
        enable_batching: true,
        ..SnapshotConfig::default()
    };

    let dyn_storage: Arc<dyn StorageAdapter> = storage.clone();
    run_world(2, move |pg| {
        let snapshot = take_to(dyn_storage.clone(), &pg, &config)?;
        restore_and_check(&snapshot, &pg, &config)
    });

    // All of this workload's writes sit below the batching threshold, so
    // each rank persisted one coalesced blob
    let paths = storage.paths();
    assert!(paths.contains(&"0/.batched".to_string()), "paths: {:?}", paths);
    assert!(paths.contains(&"1/.batched".to_string()), "paths: {:?}", paths);
}

/// Delegates to in-memory storage but rejects writes under one rank prefix.
struct FailingWrites {
    inner: MemoryStorage,
    fail_prefix: String,
}

#[async_trait]
impl StorageAdapter for FailingWrites {
    async fn read(&self, path: &str, range: Option<ByteRange>) -> snapshot_core::Result<Bytes> {
        self.inner.read(path, range).await
    }

    async fn write(&self, path: &str, data: Bytes) -> snapshot_core::Result<u64> {
        if path.starts_with(&self.fail_prefix) {
            return Err(Error::Storage {
                message: format!("injected write failure for {}", path),
            });
        }
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &str) -> snapshot_core::Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> snapshot_core::Result<bool> {
        self.inner.exists(path).await
    }
}

#[test]
fn test_failed_rank_aborts_async_commit() {
    init_tracing();
    let storage = Arc::new(FailingWrites {
        inner: MemoryStorage::new(),
        fail_prefix: "1/".to_string(),
    });
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let config = SnapshotConfig::default();

    let dyn_storage: Arc<dyn StorageAdapter> = storage.clone();
    let results = run_world_results(2, move |pg| {
        let rank = pg.rank();
        let mut trainer = Component::new(trainer_state(rank));
        let mut app_state = AppState::new();
        app_state.insert("trainer".to_string(), &mut trainer as &mut dyn Stateful);
        let pending = Snapshot::async_take(
            &mut app_state,
            dyn_storage.clone(),
            &pg,
            kv.clone(),
            &config,
            &[],
        )?;
        drop(app_state);
        pending.wait()?;
        Ok(())
    });

    // One rank's writes failed, so no rank observes a committed snapshot
    for result in &results {
        assert!(result.is_err());
    }

    // The metadata object was never written: the snapshot does not exist
    let reader: Arc<dyn StorageAdapter> = storage;
    assert!(Snapshot::open(reader).is_err());
}

#[test]
fn test_take_with_keys_held_by_one_rank_only() {
    init_tracing();
    let storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
    let config = SnapshotConfig::default();

    // The capture loop walks the union of all ranks' keys, so the ranks
    // must stay aligned across keys some of them do not hold
    let manifests = run_world(2, move |pg| {
        let rank = pg.rank();
        let mut trainer = Component::new(trainer_state(rank));
        let mut scaler_state = StateDict::new();
        scaler_state.insert(
            "value".to_string(),
            leaf(Value::Primitive(serde_json::json!(2.5))),
        );
        let mut scaler = Component::new(scaler_state);
        let mut app_state = AppState::new();
        app_state.insert("trainer".to_string(), &mut trainer as &mut dyn Stateful);
        if rank == 0 {
            app_state.insert("scaler".to_string(), &mut scaler as &mut dyn Stateful);
        }
        let snapshot = Snapshot::take(&mut app_state, storage.clone(), &pg, &config, &[])?;
        Ok(snapshot.manifest().clone())
    });

    assert_eq!(manifests[0], manifests[1]);
    assert!(manifests[0].contains_key("0/scaler/value"));
    assert!(!manifests[0].contains_key("1/scaler/value"));
}

#[test]
fn test_pattern_supplied_by_one_rank_verifies_nothing() {
    init_tracing();
    let storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
    let config = SnapshotConfig::default();

    let manifests = run_world(2, move |pg| {
        let mut model = Component::new(model_state());
        let mut app_state = AppState::new();
        app_state.insert("model".to_string(), &mut model as &mut dyn Stateful);
        let patterns = if pg.rank() == 0 { replicated_patterns() } else { Vec::new() };
        let snapshot = Snapshot::take(&mut app_state, storage.clone(), &pg, &config, &patterns)?;
        Ok(snapshot.manifest().clone())
    });

    // Replication requires agreement from every rank; without it each rank
    // keeps its own copy
    assert_eq!(manifests[0], manifests[1]);
    assert!(!manifests[0]["0/model/weight"].is_replicated());
    assert!(manifests[0].contains_key("1/model/weight"));
}

#[test]
fn test_large_replicated_tensor_is_chunked_across_ranks() {
    init_tracing();
    let storage = Arc::new(MemoryStorage::new());
    // A 10 MiB tensor against a 3 MiB chunk limit forces four chunks,
    // split between the two ranks by the partitioner
    let config = SnapshotConfig {
        max_chunk_size_bytes: 3 * 1024 * 1024,
        ..SnapshotConfig::default()
    };
    let embedding = || {
        let mut state = StateDict::new();
        state.insert(
            "weight".to_string(),
            leaf(seeded_tensor(Dtype::F32, vec![2560, 1024], 42)),
        );
        state
    };

    let dyn_storage: Arc<dyn StorageAdapter> = storage.clone();
    let manifests = run_world(2, move |pg| {
        let mut model = Component::new(embedding());
        let mut app_state = AppState::new();
        app_state.insert("model".to_string(), &mut model as &mut dyn Stateful);
        let snapshot = Snapshot::take(
            &mut app_state,
            dyn_storage.clone(),
            &pg,
            &config,
            &replicated_patterns(),
        )?;
        drop(app_state);

        let mut restored = Component::new(blank_like(&embedding()));
        let mut app_state = AppState::new();
        app_state.insert("model".to_string(), &mut restored as &mut dyn Stateful);
        snapshot.restore(&mut app_state, &pg, &config)?;
        drop(app_state);
        anyhow::ensure!(restored.state == embedding(), "rank {} restore differs", pg.rank());

        Ok(snapshot.manifest().clone())
    });

    assert_eq!(manifests[0], manifests[1]);
    match &manifests[0]["0/model/weight"] {
        Entry::ChunkedTensor(ce) => {
            assert!(ce.replicated);
            assert_eq!(ce.chunks.len(), 4);
            let offsets: Vec<u64> = ce
                .chunks
                .iter()
                .map(|c| c.offsets.first().copied().unwrap())
                .collect();
            assert_eq!(offsets, vec![0, 768, 1536, 2304]);
            // Both ranks contributed chunks
            let prefixes: std::collections::BTreeSet<&str> = ce
                .chunks
                .iter()
                .map(|c| c.location.split('/').next().unwrap())
                .collect();
            assert_eq!(prefixes.len(), 2);
        }
        other => panic!("expected chunked tensor, got {:?}", other),
    }
}
