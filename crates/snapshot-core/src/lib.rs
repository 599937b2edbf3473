//! Snapshot Core - Foundation for the distributed snapshot engine
//!
//! Provides core value types, error handling, and configuration for the
//! snapshot/restore system.

pub mod config;
pub mod error;
pub mod types;

pub use config::SnapshotConfig;
pub use error::{Error, Result};
pub use types::*;
