//! Error types for the snapshot engine

use thiserror::Error;

/// Result type alias using the snapshot Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the snapshot engine
#[derive(Error, Debug)]
pub enum Error {
    // App state errors
    #[error("Invalid app state: {message}")]
    Validation { message: String },

    #[error("Multiple RNG state objects in app state: {keys:?}")]
    MultipleRngStates { keys: Vec<String> },

    // Restore errors
    #[error("Path unavailable to rank {rank}: \"{path}\"\n{message}")]
    PathUnavailable {
        path: String,
        rank: usize,
        message: String,
    },

    // Commit errors
    #[error("Snapshot commit failed: {message}")]
    Commit { message: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Coordination errors
    #[error("Barrier timeout: {barrier_id} (waited {timeout_ms}ms)")]
    BarrierTimeout { barrier_id: String, timeout_ms: u64 },

    #[error("Process group error: {message}")]
    ProcessGroup { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Channel errors
    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
