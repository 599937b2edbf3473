//! Request batching
//!
//! Optionally coalesces many small I/O requests into fewer larger ones,
//! trading request count for fewer round-trips against the storage adapter.
//! Purely an optimization: observable results are identical with batching
//! on or off.

use crate::manifest::{Entry, Manifest};
use crate::scheduler::{ReadReq, WriteReq};
use bytes::{BufMut, Bytes, BytesMut};
use snapshot_core::ByteRange;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Coalesce small write requests into a single blob per rank.
///
/// Requests below `threshold_bytes` are concatenated into one write against
/// `rank/.batched`; the manifest entries that referenced the absorbed
/// locations are rewritten in place to point at the blob with a byte range.
/// The dot prefix keeps the blob out of the namespace app state keys can
/// reach.
/// Requests at or above the threshold pass through untouched.
pub fn batch_write_requests(
    manifest: &mut Manifest,
    write_reqs: Vec<WriteReq>,
    threshold_bytes: u64,
    rank: usize,
) -> Vec<WriteReq> {
    let mut small = Vec::new();
    let mut out = Vec::new();
    for req in write_reqs {
        if (req.buf.len() as u64) < threshold_bytes {
            small.push(req);
        } else {
            out.push(req);
        }
    }
    if small.len() < 2 {
        out.extend(small);
        return out;
    }

    let blob_path = format!("{}/.batched", rank);
    let mut relocations: HashMap<String, ByteRange> = HashMap::new();
    let mut blob = BytesMut::new();
    for req in &small {
        let start = blob.len() as u64;
        blob.put_slice(&req.buf);
        relocations.insert(req.path.clone(), ByteRange::new(start, blob.len() as u64));
    }
    debug!(
        rank,
        absorbed = small.len(),
        blob_bytes = blob.len(),
        "Batched small write requests"
    );

    for entry in manifest.values_mut() {
        relocate_entry(entry, &relocations, &blob_path);
    }

    out.push(WriteReq {
        path: blob_path,
        buf: blob.freeze(),
    });
    out
}

fn relocate_entry(entry: &mut Entry, relocations: &HashMap<String, ByteRange>, blob_path: &str) {
    match entry {
        Entry::Tensor(te) => {
            if let Some(range) = relocations.get(&te.location) {
                te.byte_range = Some(*range);
                te.location = blob_path.to_string();
            }
        }
        Entry::ChunkedTensor(ce) => {
            for chunk in &mut ce.chunks {
                if let Some(range) = relocations.get(&chunk.location) {
                    chunk.byte_range = Some(*range);
                    chunk.location = blob_path.to_string();
                }
            }
        }
        Entry::Sharded(se) => {
            for shard in &mut se.shards {
                if let Some(range) = relocations.get(&shard.location) {
                    shard.byte_range = Some(*range);
                    shard.location = blob_path.to_string();
                }
            }
        }
        Entry::Primitive(_) | Entry::Dict(_) => {}
    }
}

/// Merge read requests against the same location whose byte ranges are
/// adjacent or overlapping into single ranged reads with fanned-out
/// consumers. Whole-object reads of the same location are merged into one.
pub fn batch_read_requests(read_reqs: Vec<ReadReq>) -> Vec<ReadReq> {
    let mut whole: BTreeMap<String, ReadReq> = BTreeMap::new();
    let mut ranged: BTreeMap<String, Vec<ReadReq>> = BTreeMap::new();
    let mut out = Vec::new();

    for req in read_reqs {
        match req.byte_range {
            None => match whole.get_mut(&req.path) {
                Some(existing) => existing.consumers.extend(req.consumers),
                None => {
                    whole.insert(req.path.clone(), req);
                }
            },
            Some(_) => ranged.entry(req.path.clone()).or_default().push(req),
        }
    }

    for (_, mut reqs) in ranged {
        reqs.sort_by_key(|r| r.byte_range.map(|range| range.start));
        let mut merged: Option<ReadReq> = None;
        for req in reqs {
            let range = match req.byte_range {
                Some(range) => range,
                None => continue,
            };
            match merged.as_mut() {
                Some(current) => {
                    let current_range = match current.byte_range {
                        Some(r) => r,
                        None => continue,
                    };
                    if range.start <= current_range.end {
                        // Adjacent or overlapping: extend and re-anchor consumers
                        let new_range =
                            ByteRange::new(current_range.start, current_range.end.max(range.end));
                        for mut slice in req.consumers {
                            slice.skip += range.start - new_range.start;
                            current.consumers.push(slice);
                        }
                        current.byte_range = Some(new_range);
                        current.num_bytes = new_range.len();
                    } else {
                        if let Some(done) = merged.take() {
                            out.push(done);
                        }
                        merged = Some(req);
                    }
                }
                None => merged = Some(req),
            }
        }
        if let Some(req) = merged {
            out.push(req);
        }
    }

    out.extend(whole.into_values());
    out
}
