//! Partitioning of replicated values across ranks
//!
//! A replicated value is identical on every rank, so it only needs to be
//! written once. This module assigns write responsibility so each replicated
//! chunk/path is written by exactly one rank while total assigned bytes stay
//! balanced across ranks.

use crate::manifest::Chunk;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-path chunk plans
pub type ChunkingInstructions = BTreeMap<String, Vec<Chunk>>;

/// The chunks and non-chunked paths one rank is responsible for writing
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PartitionAssignment {
    /// Chunked tensor paths with the subset of chunks assigned to this rank
    pub chunking: ChunkingInstructions,

    /// Non-chunked paths assigned to this rank
    pub paths: Vec<String>,
}

/// Partition replicated paths across `world_size` ranks.
///
/// Chunks are sorted by descending byte size and assigned greedily to the
/// rank with the smallest running total (longest-processing-time bin
/// packing; ties break to the lowest rank index). Non-chunked paths are
/// assigned round-robin by index order, irrespective of their sizes.
///
/// The algorithm is deterministic: every rank computing this locally from
/// the same agreed chunk plan produces the same result.
pub fn partition_replicated(
    replicated_paths: &[String],
    chunking_instructions: &ChunkingInstructions,
    world_size: usize,
) -> Vec<PartitionAssignment> {
    let mut assignments = vec![PartitionAssignment::default(); world_size];
    let mut totals = vec![0u64; world_size];

    let mut chunked: Vec<(&String, &Chunk, u64)> = Vec::new();
    let mut nonchunked: Vec<&String> = Vec::new();
    for path in replicated_paths {
        match chunking_instructions.get(path) {
            Some(chunks) => {
                for chunk in chunks {
                    chunked.push((path, chunk, chunk.num_bytes()));
                }
            }
            None => nonchunked.push(path),
        }
    }

    // Stable sort keeps the input order for equal sizes, so the result is
    // reproducible on every rank.
    chunked.sort_by(|a, b| b.2.cmp(&a.2));

    for (path, chunk, size) in chunked {
        let min_rank = argmin(&totals);
        assignments[min_rank]
            .chunking
            .entry(path.clone())
            .or_default()
            .push(chunk.clone());
        totals[min_rank] += size;
    }

    for (idx, path) in nonchunked.into_iter().enumerate() {
        assignments[idx % world_size].paths.push(path.clone());
    }
    assignments
}

/// Index of the smallest element; lowest index wins ties.
fn argmin(totals: &[u64]) -> usize {
    let mut best = 0;
    for (i, &total) in totals.iter().enumerate().skip(1) {
        if total < totals[best] {
            best = i;
        }
    }
    best
}
