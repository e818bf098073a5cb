//! I/O managers for container storage backends

use crate::error::{IngestError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// In-process map, discarded on drop
    Memory,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "memory" => Ok(StorageBackend::Memory),
                _ => Err(IngestError::Configuration(format!(
                    "Unknown storage scheme: {}",
                    scheme
                ))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Key/value style access to a container's objects.
///
/// Keys are slash-delimited paths relative to the container root.
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read the object at a path
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write an object, creating parents as needed
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Check if an object or prefix exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete an object and everything nested under it. Missing paths are ignored.
    async fn delete_all(&self, path: &str) -> Result<()>;

    /// Names of the immediate children under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the backend type
    fn backend(&self) -> StorageBackend;
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a new file system I/O manager
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the full path for a relative path
    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.full_path(path);
        let data = fs::read(&full_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => IngestError::NotFound(path.to_string()),
            _ => IngestError::Io(e),
        })?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        // Create parent directories if they don't exist
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&full_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn delete_all(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = match fs::metadata(&full_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(IngestError::Io(e)),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(&full_path).await?;
        } else {
            fs::remove_file(&full_path).await?;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut entries = Vec::new();

        if full_path.is_dir() {
            let mut read_dir = fs::read_dir(&full_path).await?;

            while let Some(entry) = read_dir.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    entries.push(name.to_string());
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// In-memory I/O manager
#[derive(Default)]
pub struct MemoryIOManager {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryIOManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

fn is_under(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[async_trait]
impl IOManager for MemoryIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| IngestError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.objects
            .write()
            .insert(path.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.read().keys().any(|k| is_under(k, path)))
    }

    async fn delete_all(&self, path: &str) -> Result<()> {
        self.objects.write().retain(|k, _| !is_under(k, path));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let trimmed = prefix.trim_end_matches('/');
        let names: BTreeSet<String> = self
            .objects
            .read()
            .keys()
            .filter(|k| *k != trimmed && is_under(k, trimmed))
            .filter_map(|k| {
                let rest = if trimmed.is_empty() {
                    k.as_str()
                } else {
                    &k[trimmed.len() + 1..]
                };
                rest.split('/').next().map(str::to_string)
            })
            .collect();
        Ok(names.into_iter().collect())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// Parse URL and create appropriate I/O manager
pub async fn create_io_manager(url: &str) -> Result<Box<dyn IOManager>> {
    match StorageBackend::from_url(url)? {
        StorageBackend::FileSystem => {
            // Extract path from file:// URL or use as-is
            let path = url.strip_prefix("file://").unwrap_or(url);
            if path.is_empty() {
                return Err(IngestError::Configuration(
                    "Empty container path".to_string(),
                ));
            }
            fs::create_dir_all(path).await?;
            Ok(Box::new(FileSystemIOManager::new(path)))
        }
        StorageBackend::Memory => Ok(Box::new(MemoryIOManager::new())),
    }
}
