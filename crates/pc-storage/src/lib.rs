//! A narrow content-addressed interface for documents,
//! artifacts and logs. `LocalFsStorage` is the only implementation wired into the
//! coordinator; a VCS-backed (e.g. GitHub) provider is named by the trait but left as
//! an interface stub here, since outbound network calls are out of scope for this crate.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("backend not implemented: {0}")]
    Unimplemented(&'static str),
}

/// A write's resulting version. For a local filesystem backend this is the content
/// hash itself; a VCS-backed implementation would return a commit hash instead.
pub type Version = String;

#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    async fn write(&self, path: &str, bytes: &[u8], message: &str) -> Result<Version, StorageError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    async fn exists(&self, path: &str) -> Result<bool, StorageError>;
    async fn hash(&self, path: &str) -> Result<String, StorageError>;

    /// Multiple files written as one atomic operation when the backend supports it.
    /// `LocalFsStorage` writes each file atomically but not as a single
    /// cross-file transaction; a VCS-backed implementation can offer that as one commit.
    async fn write_batch(&self, files: &[(&str, &[u8])], message: &str) -> Result<Version, StorageError> {
        let mut last_version = String::new();
        for (path, bytes) in files {
            last_version = self.write(path, bytes, message).await?;
        }
        Ok(last_version)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Local-filesystem storage provider rooted at `base_dir`. Writes are atomic
/// (tmp-then-rename); `message` is accepted for interface parity with VCS-backed
/// providers but is not recorded anywhere by this implementation.
pub struct LocalFsStorage {
    base_dir: PathBuf,
}

impl LocalFsStorage {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.base_dir.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl StorageProvider for LocalFsStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path);
        tokio::fs::read(&full)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StorageError::NotFound(path.to_string()),
                _ => StorageError::Io(e),
            })
    }

    async fn write(&self, path: &str, bytes: &[u8], _message: &str) -> Result<Version, StorageError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp_name = full.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp = full.with_file_name(tmp_name);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &full).await?;
        Ok(sha256_hex(bytes))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.resolve(prefix);
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.base_dir) {
                    out.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }

    async fn hash(&self, path: &str) -> Result<String, StorageError> {
        let bytes = self.read(path).await?;
        Ok(sha256_hex(&bytes))
    }
}

/// Interface-only stub: a VCS-backed provider may be remote and network-bound.
/// Network calls are out of scope for this crate; wiring a real client is left to the
/// deployment that needs remote storage.
pub struct GitBackedStorage;

#[async_trait]
impl StorageProvider for GitBackedStorage {
    async fn read(&self, _path: &str) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::Unimplemented("GitBackedStorage::read"))
    }
    async fn write(&self, _path: &str, _bytes: &[u8], _message: &str) -> Result<Version, StorageError> {
        Err(StorageError::Unimplemented("GitBackedStorage::write"))
    }
    async fn list(&self, _prefix: &str) -> Result<Vec<String>, StorageError> {
        Err(StorageError::Unimplemented("GitBackedStorage::list"))
    }
    async fn exists(&self, _path: &str) -> Result<bool, StorageError> {
        Err(StorageError::Unimplemented("GitBackedStorage::exists"))
    }
    async fn hash(&self, _path: &str) -> Result<String, StorageError> {
        Err(StorageError::Unimplemented("GitBackedStorage::hash"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(tmp.path()).await.unwrap();
        let version = storage
            .write("runs/run-1/artifacts/a.txt", b"hello world", "store artifact")
            .await
            .unwrap();

        assert_eq!(version, sha256_hex(b"hello world"));
        let read_back = storage.read("runs/run-1/artifacts/a.txt").await.unwrap();
        assert_eq!(read_back, b"hello world");
    }

    #[tokio::test]
    async fn hash_matches_content_address() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(tmp.path()).await.unwrap();
        storage.write("doc.bin", b"payload", "add doc").await.unwrap();
        assert_eq!(storage.hash("doc.bin").await.unwrap(), sha256_hex(b"payload"));
    }

    #[tokio::test]
    async fn list_returns_all_paths_under_a_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(tmp.path()).await.unwrap();
        storage.write("runs/run-1/a.txt", b"a", "m").await.unwrap();
        storage.write("runs/run-1/sub/b.txt", b"b", "m").await.unwrap();
        storage.write("runs/run-2/c.txt", b"c", "m").await.unwrap();

        let listed = storage.list("runs/run-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|p| p.ends_with("a.txt")));
        assert!(listed.iter().any(|p| p.ends_with("sub/b.txt")));
    }

    #[tokio::test]
    async fn reading_a_missing_path_yields_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = LocalFsStorage::new(tmp.path()).await.unwrap();
        let err = storage.read("nope.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
