//! Rank coordination for two-phase commit
//!
//! The asynchronous commit path synchronizes ranks through a shared
//! key-value store rather than the process group, because the commit runs
//! on background threads after the take call has returned. [`KvStore`] is
//! the minimal interface the barrier needs; [`MemoryKvStore`] backs worlds
//! whose ranks share a process.

use parking_lot::{Condvar, Mutex};
use snapshot_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Poll interval for barrier waits.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared key-value store visible to every rank.
pub trait KvStore: Send + Sync {
    /// Set `key` to `value`, overwriting any previous value.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch the current value of `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

#[derive(Default)]
struct MemoryKvStoreInner {
    map: Mutex<HashMap<String, Vec<u8>>>,
    cvar: Condvar,
}

/// In-process [`KvStore`]. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<MemoryKvStoreInner>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is set or `timeout` elapses; returns its value.
    pub fn wait(&self, key: &str, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut map = self.inner.map.lock();
        loop {
            if let Some(value) = map.get(key) {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.inner.cvar.wait_for(&mut map, deadline - now);
        }
    }
}

impl KvStore for MemoryKvStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.map.lock().insert(key.to_string(), value);
        self.inner.cvar.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.map.lock().get(key).cloned())
    }
}

/// Two-phase barrier with a designated leader.
///
/// Followers announce arrival under the barrier prefix and the leader
/// blocks until all have; after doing its exclusive work the leader posts
/// the departure key, which releases the followers. Any rank can post an
/// error, which fails every rank still waiting.
pub struct LinearBarrier {
    prefix: String,
    store: Arc<dyn KvStore>,
    rank: usize,
    world_size: usize,
    leader_rank: usize,
    timeout: Duration,
}

impl LinearBarrier {
    pub fn new(
        prefix: impl Into<String>,
        store: Arc<dyn KvStore>,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            store,
            rank,
            world_size,
            leader_rank: 0,
            timeout,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.rank == self.leader_rank
    }

    fn arrived_key(&self, rank: usize) -> String {
        format!("{}/arrived/{}", self.prefix, rank)
    }

    fn depart_key(&self) -> String {
        format!("{}/depart", self.prefix)
    }

    fn error_key(&self) -> String {
        format!("{}/error", self.prefix)
    }

    /// Announce arrival. On the leader this blocks until every other rank
    /// has arrived.
    pub fn arrive(&self) -> Result<()> {
        if !self.is_leader() {
            return self.store.set(&self.arrived_key(self.rank), Vec::new());
        }
        let pending: Vec<String> = (0..self.world_size)
            .filter(|&rank| rank != self.leader_rank)
            .map(|rank| self.arrived_key(rank))
            .collect();
        self.wait_for_keys(&pending)?;
        debug!(prefix = %self.prefix, "All ranks arrived at barrier");
        Ok(())
    }

    /// Release the barrier. The leader posts the departure key; followers
    /// block until it appears.
    pub fn depart(&self) -> Result<()> {
        if self.is_leader() {
            return self.store.set(&self.depart_key(), Vec::new());
        }
        self.wait_for_keys(&[self.depart_key()])
    }

    /// Fail the barrier for every rank still waiting on it.
    pub fn report_error(&self, message: &str) -> Result<()> {
        self.store
            .set(&self.error_key(), message.as_bytes().to_vec())
    }

    fn wait_for_keys(&self, keys: &[String]) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let error_key = self.error_key();
        let mut pending: Vec<&String> = keys.iter().collect();
        loop {
            if let Some(payload) = self.store.get(&error_key)? {
                return Err(Error::Commit {
                    message: format!(
                        "a rank failed during commit: {}",
                        String::from_utf8_lossy(&payload)
                    ),
                });
            }
            let mut still_pending = Vec::new();
            for key in pending {
                if self.store.get(key)?.is_none() {
                    still_pending.push(key);
                }
            }
            if still_pending.is_empty() {
                return Ok(());
            }
            pending = still_pending;
            if Instant::now() >= deadline {
                return Err(Error::BarrierTimeout {
                    barrier_id: self.prefix.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
