//! Core value types for the snapshot engine

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element type of a tensor buffer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl Dtype {
    /// Size of one element in bytes
    pub fn element_size_bytes(&self) -> u64 {
        match self {
            Dtype::I8 | Dtype::U8 => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::F32 | Dtype::I32 | Dtype::U32 => 4,
            Dtype::F64 | Dtype::I64 | Dtype::U64 => 8,
        }
    }
}

/// Number of elements described by a shape
pub fn num_elements(shape: &[u64]) -> u64 {
    shape.iter().product()
}

/// Half-open byte range `[start, end)` within a stored object
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// A contiguous row-major tensor buffer
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuf {
    /// Element type
    pub dtype: Dtype,

    /// Shape, outermost dimension first
    pub shape: Vec<u64>,

    /// Raw row-major data
    pub data: Bytes,
}

impl TensorBuf {
    /// Create a tensor buffer, checking that the data length matches the shape.
    pub fn new(dtype: Dtype, shape: Vec<u64>, data: Bytes) -> crate::Result<Self> {
        let expected = num_elements(&shape) * dtype.element_size_bytes();
        if data.len() as u64 != expected {
            return Err(crate::Error::Validation {
                message: format!(
                    "tensor data length {} does not match shape {:?} ({} bytes expected)",
                    data.len(),
                    shape,
                    expected
                ),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    /// Total byte size of the buffer
    pub fn num_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    /// Byte size of one outermost-dimension slice (one "row")
    pub fn row_bytes(&self) -> u64 {
        let inner: u64 = self.shape.iter().skip(1).product();
        inner.max(1) * self.dtype.element_size_bytes()
    }
}

/// One locally owned shard of a row-wise partitioned global buffer
#[derive(Debug, Clone, PartialEq)]
pub struct ShardBuf {
    /// Per-dimension offsets of this shard within the global buffer
    pub offsets: Vec<u64>,

    /// Per-dimension sizes of this shard
    pub sizes: Vec<u64>,

    /// Raw row-major data of the shard
    pub data: Bytes,
}

/// The local view of a sharded value: global shape plus locally owned shards
#[derive(Debug, Clone, PartialEq)]
pub struct ShardedBuf {
    /// Element type
    pub dtype: Dtype,

    /// Global shape of the logical buffer
    pub shape: Vec<u64>,

    /// Shards owned by this rank
    pub shards: Vec<ShardBuf>,
}

/// A leaf value of a state dict
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Small directly serializable value, stored inline in the manifest
    Primitive(serde_json::Value),

    /// Opaque serialized object persisted as a byte buffer
    Bytes(Bytes),

    /// Plain tensor, chunked on write when large
    Tensor(TensorBuf),

    /// Row-wise sharded value; each rank owns disjoint row ranges
    Sharded(ShardedBuf),
}

/// A nested state representation: named containers with `Value` leaves
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Dict(StateDict),
    Leaf(Value),
}

/// Ordered nested state dict
pub type StateDict = BTreeMap<String, StateValue>;
