//! Chunk planning for large tensor buffers
//!
//! Splits one buffer into byte-range chunks bounded by a size limit, along
//! the outermost dimension only, so every chunk stays contiguous in the
//! row-major layout. Only plain (non-sharded) buffers are chunked; sharded
//! values already have natural partition boundaries.

use crate::manifest::Chunk;
use snapshot_core::TensorBuf;

/// Plan the chunks for `tensor` under `max_chunk_size_bytes`.
///
/// The returned chunks partition the buffer exactly: no gaps, no overlap,
/// union covers every element. Each chunk stays at or below the limit unless
/// a single outermost-dimension slice already exceeds it, in which case that
/// slice forms a chunk of its own (the limit is advisory, not
/// safety-critical). Buffers at or below the limit yield a single chunk.
///
/// Chunk locations are assigned later, by the rank that ends up writing the
/// chunk. A zero-row buffer yields no chunks.
pub fn plan_chunks(tensor: &TensorBuf, max_chunk_size_bytes: u64) -> Vec<Chunk> {
    if tensor.shape.is_empty() {
        // Scalar: one chunk covering the whole buffer
        return vec![Chunk {
            offsets: Vec::new(),
            sizes: Vec::new(),
            dtype: tensor.dtype,
            location: String::new(),
            byte_range: None,
        }];
    }

    let num_rows = tensor.shape[0];
    let row_bytes = tensor.row_bytes();
    let rows_per_chunk = (max_chunk_size_bytes / row_bytes).max(1);

    let mut chunks = Vec::new();
    let mut row = 0;
    while row < num_rows {
        let rows = rows_per_chunk.min(num_rows - row);
        let mut offsets = vec![0; tensor.shape.len()];
        offsets[0] = row;
        let mut sizes = tensor.shape.clone();
        sizes[0] = rows;
        chunks.push(Chunk {
            offsets,
            sizes,
            dtype: tensor.dtype,
            location: String::new(),
            byte_range: None,
        });
        row += rows;
    }
    chunks
}
