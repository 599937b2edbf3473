//! Manifest data model
//!
//! The manifest is the authoritative path -> entry description of a
//! snapshot's contents. Paths follow the grammar
//! `rank/statefulName/stateDictKey[/nestedKey...]`; the leading rank segment
//! is only semantically meaningful for per-rank entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapshot_core::{num_elements, ByteRange, Dtype, Error, Result};
use std::collections::BTreeMap;

/// Name of the metadata object within a snapshot root.
///
/// Written exactly once, by rank 0, after all data writes have completed.
/// A reader that cannot find it must treat the snapshot as nonexistent.
pub const SNAPSHOT_METADATA_PATH: &str = ".snapshot_metadata";

/// Ordered mapping from logical path to entry
pub type Manifest = BTreeMap<String, Entry>;

/// An inline, small, directly serializable value. Reading it back requires
/// no storage I/O.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrimitiveEntry {
    pub value: serde_json::Value,
    pub replicated: bool,
}

/// One contiguous persisted buffer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TensorEntry {
    pub location: String,
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    /// Set when the batcher coalesced this value into a shared blob
    pub byte_range: Option<ByteRange>,
    pub replicated: bool,
}

/// A contiguous row-range slice of a larger buffer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Per-dimension offsets within the logical buffer
    pub offsets: Vec<u64>,

    /// Per-dimension sizes of the chunk
    pub sizes: Vec<u64>,

    pub dtype: Dtype,
    pub location: String,
    pub byte_range: Option<ByteRange>,
}

impl Chunk {
    /// Total byte size of the chunk
    pub fn num_bytes(&self) -> u64 {
        num_elements(&self.sizes) * self.dtype.element_size_bytes()
    }
}

/// A buffer persisted as an ordered list of chunks that partition it exactly
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkedTensorEntry {
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    pub chunks: Vec<Chunk>,
    pub replicated: bool,
}

/// One shard of a row-wise partitioned value, owned by a single rank at
/// save time but globally readable at restore time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Shard {
    pub offsets: Vec<u64>,
    pub sizes: Vec<u64>,
    pub location: String,
    pub byte_range: Option<ByteRange>,
}

/// A sharded value. Sharded entries are never replicated: the two
/// classifications are mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardedEntry {
    pub dtype: Dtype,
    pub shape: Vec<u64>,
    pub shards: Vec<Shard>,
}

/// A named container, recorded so that nesting structure (including empty
/// containers) survives the flatten/inflate round trip
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DictEntry {
    pub keys: Vec<String>,
}

/// The persisted description of one logical value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entry {
    Primitive(PrimitiveEntry),
    Tensor(TensorEntry),
    ChunkedTensor(ChunkedTensorEntry),
    Sharded(ShardedEntry),
    Dict(DictEntry),
}

impl Entry {
    /// Whether the entry was verified identical across all ranks at save time
    pub fn is_replicated(&self) -> bool {
        match self {
            Entry::Primitive(e) => e.replicated,
            Entry::Tensor(e) => e.replicated,
            Entry::ChunkedTensor(e) => e.replicated,
            Entry::Sharded(_) => false,
            Entry::Dict(_) => false,
        }
    }
}

/// Snapshot metadata: the commit marker
///
/// Persisted exactly once per snapshot, after all data writes for that
/// snapshot have completed. Immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    /// Format version (engine version at save time)
    pub version: String,

    /// Number of participating ranks at save time
    pub world_size: usize,

    /// Timestamp when the snapshot was committed
    pub created_at: DateTime<Utc>,

    /// Global manifest: every rank's entries under its rank prefix
    pub manifest: Manifest,
}

impl SnapshotMetadata {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// fnmatch-style glob matching for replication hints.
///
/// `*` matches any sequence of characters (including `/`, so `**` behaves
/// identically), `?` matches any single character. Everything else matches
/// literally.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = path.chars().collect();
    let (mut p, mut i) = (0usize, 0usize);
    let (mut star, mut mark) = (None, 0usize);
    while i < s.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == s[i]) {
            p += 1;
            i += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = i;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            mark += 1;
            i = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// Split a global manifest path into its rank prefix and logical path.
pub fn split_rank_path(path: &str) -> Result<(usize, &str)> {
    let (rank_str, logical) = path.split_once('/').ok_or_else(|| Error::Validation {
        message: format!("malformed manifest path (missing rank prefix): \"{}\"", path),
    })?;
    let rank = rank_str.parse().map_err(|_| Error::Validation {
        message: format!("malformed manifest path (bad rank prefix): \"{}\"", path),
    })?;
    Ok((rank, logical))
}

/// Compute the logical entries available to `rank`.
///
/// The view contains the rank's own entries, replicated entries contributed
/// by any rank, container entries from any rank, and sharded entries with
/// their shards merged across all contributing ranks. This is what makes a
/// snapshot readable by ranks that did not exist at save time.
pub fn get_available_entries(manifest: &Manifest, rank: usize) -> Result<Manifest> {
    let mut available = Manifest::new();
    let mut sharded: BTreeMap<String, ShardedEntry> = BTreeMap::new();

    for (path, entry) in manifest {
        let (entry_rank, logical) = split_rank_path(path)?;
        match entry {
            Entry::Sharded(se) => {
                let merged = sharded.entry(logical.to_string()).or_insert_with(|| {
                    ShardedEntry {
                        dtype: se.dtype,
                        shape: se.shape.clone(),
                        shards: Vec::new(),
                    }
                });
                merged.shards.extend(se.shards.iter().cloned());
            }
            _ if entry_rank == rank => {
                available.insert(logical.to_string(), entry.clone());
            }
            Entry::Dict(_) => {
                available
                    .entry(logical.to_string())
                    .or_insert_with(|| entry.clone());
            }
            _ if entry.is_replicated() => {
                available
                    .entry(logical.to_string())
                    .or_insert_with(|| entry.clone());
            }
            _ => {}
        }
    }

    for (logical, mut se) in sharded {
        se.shards.sort_by(|a, b| a.offsets.cmp(&b.offsets));
        se.shards.dedup_by(|a, b| a.offsets == b.offsets);
        available.insert(logical, Entry::Sharded(se));
    }
    Ok(available)
}

/// Merge per-rank manifest fragments into one global manifest.
///
/// Replicated entries contributed by multiple ranks are deduplicated; a
/// chunked replicated entry written partly by several ranks has its chunks
/// combined and re-sorted by offsets. Every rank's fragment lands under its
/// rank prefix, with replicated entries injected under every rank prefix.
pub fn merge_rank_manifests(fragments: &[Manifest]) -> Result<Manifest> {
    let mut replicated: BTreeMap<String, Entry> = BTreeMap::new();
    for fragment in fragments {
        for (path, entry) in fragment {
            if !entry.is_replicated() {
                continue;
            }
            match replicated.get_mut(path) {
                None => {
                    replicated.insert(path.clone(), entry.clone());
                }
                Some(Entry::ChunkedTensor(existing)) => {
                    if let Entry::ChunkedTensor(incoming) = entry {
                        existing.chunks.extend(incoming.chunks.iter().cloned());
                    } else {
                        return Err(Error::Validation {
                            message: format!(
                                "conflicting entry kinds for replicated path \"{}\"",
                                path
                            ),
                        });
                    }
                }
                Some(_) => {
                    return Err(Error::Validation {
                        message: format!(
                            "replicated path \"{}\" emitted by multiple ranks but is not chunked",
                            path
                        ),
                    });
                }
            }
        }
    }

    for entry in replicated.values_mut() {
        if let Entry::ChunkedTensor(ce) = entry {
            ce.chunks.sort_by(|a, b| a.offsets.cmp(&b.offsets));
        }
    }

    let mut global = Manifest::new();
    for (rank, fragment) in fragments.iter().enumerate() {
        let mut merged = fragment.clone();
        for (path, entry) in &replicated {
            merged.insert(path.clone(), entry.clone());
        }
        for (logical, entry) in merged {
            global.insert(format!("{}/{}", rank, logical), entry);
        }
    }
    Ok(global)
}
