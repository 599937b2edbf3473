//! Budgeted execution of snapshot I/O requests
//!
//! Executes a batch of read or write requests against a storage adapter
//! while keeping total in-flight buffer bytes at or below a memory budget,
//! maximizing concurrency otherwise. Requests beyond the budget wait for
//! active requests to finish; a single request larger than the whole budget
//! is admitted alone (the budget is advisory, not safety-critical).

use bytes::Bytes;
use parking_lot::Mutex;
use snapshot_core::{ByteRange, Error, Result};
use std::sync::Arc;
use std::time::Instant;
use storage::StorageAdapter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Budget accounting granularity
const BUDGET_UNIT_BYTES: u64 = 1024;

/// Request to write one buffer to storage
#[derive(Debug, Clone)]
pub struct WriteReq {
    /// Storage path
    pub path: String,

    /// Buffer to persist
    pub buf: Bytes,
}

/// Shared destination buffer a read request fills
pub type ReadBuffer = Arc<Mutex<Vec<u8>>>;

/// One destination slice of a read request
///
/// Normally a request has exactly one consumer covering the whole fetched
/// buffer; request batching can fan a single fetch out to several.
#[derive(Debug, Clone)]
pub struct ReadSlice {
    /// Offset into the fetched bytes
    pub skip: u64,

    /// Number of bytes to copy
    pub len: u64,

    /// Destination buffer
    pub dest: ReadBuffer,

    /// Offset into the destination buffer
    pub dest_offset: u64,
}

/// Request to read one buffer (or byte range) from storage
#[derive(Debug, Clone)]
pub struct ReadReq {
    /// Storage path
    pub path: String,

    /// Byte range within the stored object, when not reading all of it
    pub byte_range: Option<ByteRange>,

    /// Expected fetch size, used for budget accounting
    pub num_bytes: u64,

    /// Destinations the fetched bytes are copied into
    pub consumers: Vec<ReadSlice>,
}

impl ReadReq {
    /// A request with a single consumer covering the whole fetch
    pub fn single(
        path: String,
        byte_range: Option<ByteRange>,
        num_bytes: u64,
        dest: ReadBuffer,
        dest_offset: u64,
    ) -> Self {
        Self {
            path,
            byte_range,
            num_bytes,
            consumers: vec![ReadSlice {
                skip: 0,
                len: num_bytes,
                dest,
                dest_offset,
            }],
        }
    }
}

/// Tracks in-flight buffer bytes for one scheduler batch
#[derive(Clone)]
struct MemoryBudget {
    sem: Arc<Semaphore>,
    total_units: u32,
}

impl MemoryBudget {
    fn new(budget_bytes: u64) -> Self {
        let units = (budget_bytes / BUDGET_UNIT_BYTES)
            .clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize) as u64);
        Self {
            sem: Arc::new(Semaphore::new(units as usize)),
            total_units: units as u32,
        }
    }

    /// Wait until `bytes` fit under the budget. An oversized request claims
    /// the whole budget, so it runs with nothing else in flight.
    async fn acquire(&self, bytes: u64) -> Result<OwnedSemaphorePermit> {
        let units = ((bytes + BUDGET_UNIT_BYTES - 1) / BUDGET_UNIT_BYTES)
            .clamp(1, self.total_units as u64) as u32;
        self.sem
            .clone()
            .acquire_many_owned(units)
            .await
            .map_err(|_| Error::ChannelClosed {
                channel: "scheduler memory budget".to_string(),
            })
    }
}

/// Handle to a scheduled batch of I/O requests
///
/// `complete()` blocks the caller until all requests finish or one fails,
/// and propagates the first failure. Requests keep running concurrently
/// until then; no ordering is guaranteed among them.
pub struct PendingIoWork {
    tasks: JoinSet<Result<()>>,
    kind: &'static str,
    rank: usize,
    total_bytes: u64,
    started: Instant,
}

impl PendingIoWork {
    /// Wait for every request in the batch; the first failure aborts the
    /// rest of the batch and is returned.
    pub async fn complete(mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.tasks.shutdown().await;
                    return Err(e);
                }
                Err(e) => {
                    self.tasks.shutdown().await;
                    return Err(Error::Storage {
                        message: format!("{} task aborted: {}", self.kind, e),
                    });
                }
            }
        }
        let elapsed = self.started.elapsed();
        info!(
            rank = self.rank,
            kind = self.kind,
            total_bytes = self.total_bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            throughput_mbps =
                (self.total_bytes as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64().max(1e-9),
            "I/O batch complete"
        );
        Ok(())
    }
}

/// Schedule a batch of write requests. Must be called within a tokio
/// runtime; the returned work completes on that runtime.
pub fn execute_write_reqs(
    write_reqs: Vec<WriteReq>,
    storage: Arc<dyn StorageAdapter>,
    memory_budget_bytes: u64,
    rank: usize,
) -> PendingIoWork {
    let budget = MemoryBudget::new(memory_budget_bytes);
    let total_bytes: u64 = write_reqs.iter().map(|r| r.buf.len() as u64).sum();
    debug!(
        rank,
        requests = write_reqs.len(),
        total_bytes,
        memory_budget_bytes,
        "Scheduling write requests"
    );

    let mut tasks = JoinSet::new();
    for req in write_reqs {
        let storage = storage.clone();
        let budget = budget.clone();
        tasks.spawn(async move {
            let _permit = budget.acquire(req.buf.len() as u64).await?;
            storage.write(&req.path, req.buf).await?;
            Ok(())
        });
    }
    PendingIoWork {
        tasks,
        kind: "write",
        rank,
        total_bytes,
        started: Instant::now(),
    }
}

/// Schedule a batch of read requests. Must be called within a tokio
/// runtime; the returned work completes on that runtime.
pub fn execute_read_reqs(
    read_reqs: Vec<ReadReq>,
    storage: Arc<dyn StorageAdapter>,
    memory_budget_bytes: u64,
    rank: usize,
) -> PendingIoWork {
    let budget = MemoryBudget::new(memory_budget_bytes);
    let total_bytes: u64 = read_reqs.iter().map(|r| r.num_bytes).sum();
    debug!(
        rank,
        requests = read_reqs.len(),
        total_bytes,
        memory_budget_bytes,
        "Scheduling read requests"
    );

    let mut tasks = JoinSet::new();
    for req in read_reqs {
        let storage = storage.clone();
        let budget = budget.clone();
        tasks.spawn(async move {
            let _permit = budget.acquire(req.num_bytes).await?;
            let data = storage.read(&req.path, req.byte_range).await?;
            for slice in &req.consumers {
                let end = slice.skip + slice.len;
                if end > data.len() as u64 {
                    return Err(Error::Storage {
                        message: format!(
                            "short read from {}: got {} bytes, consumer needs [{}, {})",
                            req.path,
                            data.len(),
                            slice.skip,
                            end
                        ),
                    });
                }
                let src = &data[slice.skip as usize..end as usize];
                let mut dest = slice.dest.lock();
                let dest_end = (slice.dest_offset + slice.len) as usize;
                if dest_end > dest.len() {
                    return Err(Error::Storage {
                        message: format!(
                            "read destination overflow for {}: buffer is {} bytes, \
                             consumer writes [{}, {})",
                            req.path,
                            dest.len(),
                            slice.dest_offset,
                            dest_end
                        ),
                    });
                }
                dest[slice.dest_offset as usize..dest_end].copy_from_slice(src);
            }
            Ok(())
        });
    }
    PendingIoWork {
        tasks,
        kind: "read",
        rank,
        total_bytes,
        started: Instant::now(),
    }
}
