//! Local filesystem storage adapter
//!
//! Provides async file I/O with atomic writes to prevent partial/corrupt files
//! and ranged reads for chunked/batched snapshot data.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use snapshot_core::{ByteRange, Error, Result};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageAdapter;

/// Local filesystem storage adapter
///
/// Stores data in a local directory with support for:
/// - Atomic writes (write to .tmp, then rename)
/// - Byte-range reads
/// - Automatic directory creation
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Base path for all storage operations
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage instance rooted at `base_path`
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative path to an absolute path
    fn resolve_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    /// Generate a unique temporary file path
    fn temp_path(&self, path: &str) -> PathBuf {
        let full_path = self.resolve_path(path);
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }
}

#[async_trait]
impl StorageAdapter for LocalStorage {
    #[instrument(skip(self), fields(adapter = "local"))]
    async fn read(&self, path: &str, range: Option<ByteRange>) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, ?range, "Reading file");

        match range {
            None => match fs::read(&full_path).await {
                Ok(data) => Ok(Bytes::from(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(Error::StoragePathNotFound {
                        path: path.to_string(),
                    })
                }
                Err(e) => Err(Error::Storage {
                    message: format!("Failed to read {}: {}", path, e),
                }),
            },
            Some(range) => {
                let mut file = match fs::File::open(&full_path).await {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(Error::StoragePathNotFound {
                            path: path.to_string(),
                        })
                    }
                    Err(e) => {
                        return Err(Error::Storage {
                            message: format!("Failed to open {}: {}", path, e),
                        })
                    }
                };
                file.seek(std::io::SeekFrom::Start(range.start))
                    .await
                    .map_err(Error::Io)?;
                let mut buf = vec![0u8; range.len() as usize];
                file.read_exact(&mut buf).await.map_err(|e| Error::Storage {
                    message: format!(
                        "Failed to read bytes [{}, {}) of {}: {}",
                        range.start, range.end, path, e
                    ),
                })?;
                Ok(Bytes::from(buf))
            }
        }
    }

    #[instrument(skip(self, data), fields(adapter = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path);
        let temp_path = self.temp_path(path);
        let size = data.len() as u64;

        debug!(?full_path, ?temp_path, size, "Writing file atomically");

        // Ensure parent directory exists
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage {
                    message: format!("Failed to create directory {:?}: {}", parent, e),
                })?;
        }

        // Write to temporary file
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create temp file {:?}: {}", temp_path, e),
            })?;

        file.write_all(&data).await.map_err(|e| Error::Storage {
            message: format!("Failed to write data: {}", e),
        })?;

        file.sync_all().await.map_err(|e| Error::Storage {
            message: format!("Failed to sync file: {}", e),
        })?;

        // Atomic rename
        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to rename {:?} to {:?}: {}", temp_path, full_path, e),
            })?;

        debug!(?full_path, size, "File written successfully");
        Ok(size)
    }

    #[instrument(skip(self), fields(adapter = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        debug!(?full_path, "Deleting file");

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to delete {}: {}", path, e),
            }),
        }
    }

    #[instrument(skip(self), fields(adapter = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path);
        Ok(fs::metadata(&full_path).await.is_ok())
    }
}
