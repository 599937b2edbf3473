//! Elastic restore tests
//!
//! Snapshots must restore under a world size different from the one that
//! took them: replicated values restore anywhere, sharded values re-partition
//! across the new ranks, and plain per-rank values stay tied to the rank
//! that saved them.

use anyhow::Result;
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use snapshot::{AppState, LocalProcessGroup, ProcessGroup, Snapshot, Stateful};
use snapshot_core::{
    num_elements, Dtype, Error, ShardBuf, ShardedBuf, SnapshotConfig, StateDict, StateValue,
    TensorBuf, Value,
};
use std::sync::Arc;
use std::thread;
use storage::{MemoryStorage, StorageAdapter};

struct Component {
    state: StateDict,
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

const TABLE_ROWS: u64 = 8;
const TABLE_COLS: u64 = 4;

fn full_table_data() -> Bytes {
    seeded_bytes((TABLE_ROWS * TABLE_COLS * 4) as usize, 11)
}

fn model_state() -> StateDict {
    let shape = vec![16u64, 8];
    let len = (num_elements(&shape) * 4) as usize;
    let mut state = StateDict::new();
    state.insert(
        "weight".to_string(),
        leaf(Value::Tensor(
            TensorBuf::new(Dtype::F32, shape, seeded_bytes(len, 7)).unwrap(),
        )),
    );
    state
}

fn counter_state(rank: usize) -> StateDict {
    let mut state = StateDict::new();
    state.insert(
        "value".to_string(),
        leaf(Value::Primitive(serde_json::json!(rank * 10 + 1))),
    );
    state
}

/// One contiguous row-range shard of the global table per rank.
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

fn blank_table_state(rank: usize, world_size: usize) -> StateDict {
    let mut state = table_state(rank, world_size);
    if let Some(StateValue::Leaf(Value::Sharded(sharded))) = state.get_mut("embeddings") {
        for shard in &mut sharded.shards {
            shard.data = Bytes::from(vec![0u8; shard.data.len()]);
        }
    }
    state
}

fn run_world<T, F>(world_size: usize, f: F) -> Vec<T>
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
        .enumerate()
        .map(|(rank, handle)| {
            handle
                .join()
                .expect("rank panicked")
                .unwrap_or_else(|e| panic!("rank {} failed: {:#}", rank, e))
        })
        .collect()
}

/// Take a snapshot with `world_size` ranks and return the shared storage.
fn save_world(world_size: usize) -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    let dyn_storage: Arc<dyn StorageAdapter> = storage.clone();
    let config = SnapshotConfig::default();
    run_world(world_size, move |pg| {
        let rank = pg.rank();
        let mut model = Component { state: model_state() };
        let mut counter = Component { state: counter_state(rank) };
        let mut table = Component { state: table_state(rank, pg.world_size()) };
        let mut app_state = AppState::new();
        app_state.insert("model".to_string(), &mut model as &mut dyn Stateful);
        app_state.insert("counter".to_string(), &mut counter as &mut dyn Stateful);
        app_state.insert("table".to_string(), &mut table as &mut dyn Stateful);
        Snapshot::take(
            &mut app_state,
            dyn_storage.clone(),
            &pg,
            &config,
            &["model/**".to_string()],
        )?;
        Ok(())
    });
    storage
}

#[test]
fn test_restore_with_fewer_ranks() {
    let storage = save_world(4);
    let dyn_storage: Arc<dyn StorageAdapter> = storage;
    let config = SnapshotConfig::default();

    run_world(2, move |pg| {
        let rank = pg.rank();
        let snapshot = Snapshot::open(dyn_storage.clone())?;
        assert_eq!(snapshot.metadata().world_size, 4);

        let mut model = Component { state: model_state() };
        let mut counter = Component { state: counter_state(99) };
        let mut table = Component { state: blank_table_state(rank, 2) };
        let mut app_state = AppState::new();
        app_state.insert("model".to_string(), &mut model as &mut dyn Stateful);
        app_state.insert("counter".to_string(), &mut counter as &mut dyn Stateful);
        app_state.insert("table".to_string(), &mut table as &mut dyn Stateful);
        snapshot.restore(&mut app_state, &pg, &config)?;
        drop(app_state);

        // Replicated and per-rank values restore directly
        anyhow::ensure!(model.state == model_state());
        anyhow::ensure!(counter.state == counter_state(rank));

        // Each new rank's 4-row shard is reassembled from the 2-row shards
        // the old world persisted
        anyhow::ensure!(table.state == table_state(rank, 2), "table differs on rank {rank}");
        Ok(())
    });
}

/// A newly provisioned rank restoring on its own, before any peers join.
struct DetachedRank {
    rank: usize,
    world_size: usize,
}

impl ProcessGroup for DetachedRank {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> snapshot_core::Result<()> {
        Ok(())
    }

    fn all_gather(&self, payload: Vec<u8>) -> snapshot_core::Result<Vec<Vec<u8>>> {
        Ok(vec![payload])
    }

    fn broadcast(&self, payload: Option<Vec<u8>>, _src: usize) -> snapshot_core::Result<Vec<u8>> {
        payload.ok_or(Error::ProcessGroup {
            message: "broadcast: no peers".to_string(),
        })
    }

    fn scatter(&self, inputs: Option<Vec<Vec<u8>>>, _src: usize) -> snapshot_core::Result<Vec<u8>> {
        inputs
            .and_then(|mut inputs| inputs.pop())
            .ok_or(Error::ProcessGroup {
                message: "scatter: no peers".to_string(),
            })
    }
}

#[test]
fn test_restore_of_foreign_rank_value_reports_unavailable() {
    let storage = save_world(2);
    let dyn_storage: Arc<dyn StorageAdapter> = storage;
    let config = SnapshotConfig::default();
    let snapshot = Snapshot::open(dyn_storage).unwrap();

    // Rank 2 never existed in the saved world, so its counter was never
    // persisted anywhere
    let pg = DetachedRank { rank: 2, world_size: 3 };
    let mut counter = Component { state: counter_state(0) };
    let mut app_state = AppState::new();
    app_state.insert("counter".to_string(), &mut counter as &mut dyn Stateful);
    match snapshot.restore(&mut app_state, &pg, &config) {
        Err(Error::PathUnavailable { path, rank, message }) => {
            assert_eq!(path, "counter/value");
            assert_eq!(rank, 2);
            assert!(message.contains("belongs to a different rank"), "{}", message);
        }
        other => panic!("expected PathUnavailable, got {:?}", other),
    }
}

#[test]
fn test_per_rank_value_unavailable_to_new_rank() {
    let storage = save_world(2);
    let dyn_storage: Arc<dyn StorageAdapter> = storage;
    let config = SnapshotConfig::default();
    let snapshot = Snapshot::open(dyn_storage).unwrap();

    // Rank 2 never existed; its counter was never saved anywhere
    let err = snapshot.read_object("2/counter/value", &config).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("belongs to a different rank"), "{}", message);

    let err = snapshot.read_object("0/counter/ghost", &config).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("does not exist"), "{}", message);
}

#[test]
fn test_sharded_value_readable_from_any_rank() {
    let storage = save_world(2);
    let dyn_storage: Arc<dyn StorageAdapter> = storage;
    let config = SnapshotConfig::default();
    let snapshot = Snapshot::open(dyn_storage).unwrap();

    // A rank that saved nothing still reads the merged table as one tensor
    let value = snapshot.read_object("7/table/embeddings", &config).unwrap();
    match value {
        Value::Tensor(tensor) => {
            assert_eq!(tensor.shape, vec![TABLE_ROWS, TABLE_COLS]);
            assert_eq!(tensor.data, full_table_data());
        }
        other => panic!("expected assembled tensor, got {:?}", other),
    }
}

#[test]
fn test_replicated_value_restores_under_world_of_one() {
    let storage = save_world(2);
    let dyn_storage: Arc<dyn StorageAdapter> = storage;
    let config = SnapshotConfig::default();
    let snapshot = Snapshot::open(dyn_storage).unwrap();

    let pg = snapshot::SingleProcess;
    let mut model = Component { state: model_state() };
    let mut app_state = AppState::new();
    app_state.insert("model".to_string(), &mut model as &mut dyn Stateful);
    snapshot.restore(&mut app_state, &pg, &config).unwrap();
    drop(app_state);
    assert_eq!(model.state, model_state());
}
