//! Collective communication
//!
//! Snapshot coordination needs a handful of collectives (barrier, all-gather,
//! broadcast, scatter) between the participating ranks. [`ProcessGroup`]
//! abstracts over the transport with blocking byte-payload operations; every
//! rank must issue the same sequence of collectives in the same order.
//!
//! [`SingleProcess`] serves the world-size-one case and [`LocalProcessGroup`]
//! connects ranks running as threads of one process, which is what the
//! integration tests use.

use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use snapshot_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Blocking collectives between the ranks taking part in a snapshot.
pub trait ProcessGroup: Send + Sync {
    /// This participant's rank, in `0..world_size`.
    fn rank(&self) -> usize;

    /// Number of participating ranks.
    fn world_size(&self) -> usize;

    /// Block until every rank has reached the barrier.
    fn barrier(&self) -> Result<()>;

    /// Gather one payload from every rank; the result is indexed by rank.
    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Send `src`'s payload to every rank. `payload` must be `Some` on `src`
    /// and `None` elsewhere.
    fn broadcast(&self, payload: Option<Vec<u8>>, src: usize) -> Result<Vec<u8>>;

    /// Distribute one payload per rank from `src`. `inputs` must be `Some`
    /// with `world_size` elements on `src` and `None` elsewhere.
    fn scatter(&self, inputs: Option<Vec<Vec<u8>>>, src: usize) -> Result<Vec<u8>>;
}

fn check_src_payload<T>(payload: &Option<T>, rank: usize, src: usize, op: &str) -> Result<()> {
    match (payload.is_some(), rank == src) {
        (true, true) | (false, false) => Ok(()),
        (true, false) => Err(Error::ProcessGroup {
            message: format!("{op}: payload supplied on non-source rank {rank}"),
        }),
        (false, true) => Err(Error::ProcessGroup {
            message: format!("{op}: missing payload on source rank {src}"),
        }),
    }
}

/// Trivial process group for a world of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![payload])
    }

    fn broadcast(&self, payload: Option<Vec<u8>>, src: usize) -> Result<Vec<u8>> {
        check_src_payload(&payload, 0, src, "broadcast")?;
        payload.ok_or(Error::ProcessGroup {
            message: "broadcast: missing payload on source rank 0".to_string(),
        })
    }

    fn scatter(&self, inputs: Option<Vec<Vec<u8>>>, src: usize) -> Result<Vec<u8>> {
        check_src_payload(&inputs, 0, src, "scatter")?;
        let mut inputs = inputs.ok_or(Error::ProcessGroup {
            message: "scatter: missing payload on source rank 0".to_string(),
        })?;
        if inputs.len() != 1 {
            return Err(Error::ProcessGroup {
                message: format!("scatter: expected 1 input, got {}", inputs.len()),
            });
        }
        Ok(inputs.remove(0))
    }
}

struct RoundResult {
    data: Arc<Vec<Vec<u8>>>,
    remaining_readers: usize,
}

struct RendezvousState {
    /// Round currently accepting contributions.
    round: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    /// Completed rounds not yet read by every rank.
    results: HashMap<u64, RoundResult>,
}

struct Rendezvous {
    world_size: usize,
    state: Mutex<RendezvousState>,
    cvar: Condvar,
}

/// Process group connecting ranks that run as threads of one process.
///
/// Every collective is built on a single exchange primitive: each rank
/// deposits a payload for the current round and blocks until all payloads
/// of that round are available. Rounds are numbered per handle, so the
/// ranks stay aligned as long as they issue the same sequence of
/// collectives.
pub struct LocalProcessGroup {
    rank: usize,
    next_round: Mutex<u64>,
    shared: Arc<Rendezvous>,
}

impl LocalProcessGroup {
    /// Create the handles for a world of `world_size` ranks, indexed by rank.
    pub fn create(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(Rendezvous {
            world_size,
            state: Mutex::new(RendezvousState {
                round: 0,
                arrived: 0,
                slots: vec![None; world_size],
                results: HashMap::new(),
            }),
            cvar: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                next_round: Mutex::new(0),
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Deposit `payload` and block until every rank's payload for the same
    /// round is available.
    fn exchange(&self, payload: Vec<u8>) -> Arc<Vec<Vec<u8>>> {
        let my_round = {
            let mut next = self.next_round.lock();
            let round = *next;
            *next += 1;
            round
        };

        let mut st = self.shared.state.lock();
        while st.round != my_round {
            self.shared.cvar.wait(&mut st);
        }
        st.slots[self.rank] = Some(payload);
        st.arrived += 1;
        if st.arrived == self.shared.world_size {
            let data: Vec<Vec<u8>> = st
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            st.results.insert(
                my_round,
                RoundResult {
                    data: Arc::new(data),
                    remaining_readers: self.shared.world_size,
                },
            );
            st.arrived = 0;
            st.round += 1;
            self.shared.cvar.notify_all();
        }
        loop {
            if let Some(result) = st.results.get_mut(&my_round) {
                let data = Arc::clone(&result.data);
                result.remaining_readers -= 1;
                if result.remaining_readers == 0 {
                    st.results.remove(&my_round);
                }
                return data;
            }
            self.shared.cvar.wait(&mut st);
        }
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.exchange(Vec::new());
        Ok(())
    }

    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(self.exchange(payload).to_vec())
    }

    fn broadcast(&self, payload: Option<Vec<u8>>, src: usize) -> Result<Vec<u8>> {
        check_src_payload(&payload, self.rank, src, "broadcast")?;
        let gathered = self.exchange(payload.unwrap_or_default());
        Ok(gathered[src].clone())
    }

    fn scatter(&self, inputs: Option<Vec<Vec<u8>>>, src: usize) -> Result<Vec<u8>> {
        check_src_payload(&inputs, self.rank, src, "scatter")?;
        if let Some(inputs) = &inputs {
            if inputs.len() != self.shared.world_size {
                return Err(Error::ProcessGroup {
                    message: format!(
                        "scatter: expected {} inputs, got {}",
                        self.shared.world_size,
                        inputs.len()
                    ),
                });
            }
        }
        let encoded = match inputs {
            Some(inputs) => {
                bincode::serialize(&inputs).map_err(|e| Error::Serialization(e.to_string()))?
            }
            None => Vec::new(),
        };
        let gathered = self.exchange(encoded);
        let mut decoded: Vec<Vec<u8>> = bincode::deserialize(&gathered[src])
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(decoded.swap_remove(self.rank))
    }
}

/// Gather one typed value from every rank, bincode on the wire.
pub fn all_gather_object<T: Serialize + DeserializeOwned>(
    pg: &dyn ProcessGroup,
    value: &T,
) -> Result<Vec<T>> {
    let payload = bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
    pg.all_gather(payload)?
        .iter()
        .map(|bytes| bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string())))
        .collect()
}

/// Broadcast one typed value from `src`, bincode on the wire.
pub fn broadcast_object<T: Serialize + DeserializeOwned>(
    pg: &dyn ProcessGroup,
    value: Option<&T>,
    src: usize,
) -> Result<T> {
    let payload = value
        .map(|v| bincode::serialize(v).map_err(|e| Error::Serialization(e.to_string())))
        .transpose()?;
    let bytes = pg.broadcast(payload, src)?;
    bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// Scatter one typed value per rank from `src`, bincode on the wire.
pub fn scatter_object<T: Serialize + DeserializeOwned>(
    pg: &dyn ProcessGroup,
    values: Option<Vec<T>>,
    src: usize,
) -> Result<T> {
    let inputs = values
        .map(|values| {
            values
                .iter()
                .map(|v| bincode::serialize(v).map_err(|e| Error::Serialization(e.to_string())))
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;
    let bytes = pg.scatter(inputs, src)?;
    bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))
}

/// Gather one typed value from every rank, JSON on the wire.
///
/// Used for payloads holding `serde_json::Value`, which bincode cannot
/// decode (it needs a self-describing format).
pub fn all_gather_json<T: Serialize + DeserializeOwned>(
    pg: &dyn ProcessGroup,
    value: &T,
) -> Result<Vec<T>> {
    let payload = serde_json::to_vec(value)?;
    pg.all_gather(payload)?
        .iter()
        .map(|bytes| serde_json::from_slice(bytes).map_err(Error::from))
        .collect()
}
