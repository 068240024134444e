//! External collaborator contracts for file and artifact sources.
//!
//! Capstan never stores or indexes files itself. Callers hand it either
//! local paths or handles into their own file store (artifacts, config
//! files), and the executors pull bytes through these traits at transfer
//! time. A [`FileProvider`] is the call-scoped capability the transfer
//! primitives consume: metadata plus a byte-source opener, satisfiable by
//! local disk, a remote store, or an in-memory buffer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::connection::SessionError;

/// Errors raised while sourcing or transferring file content.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Streaming bytes to the destination failed.
    #[error("File transfer failed: {0}")]
    Transfer(String),

    /// The requested file does not exist in its source.
    #[error("File not found: {0}")]
    NotFound(String),

    /// The transport does not implement this operation. Distinct from
    /// success so callers cannot mistake a skipped copy for a completed one.
    #[error("Operation not implemented: {0}")]
    NotImplemented(String),

    /// I/O error reading the source or writing the destination.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The underlying session failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A boxed async byte stream.
pub type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

/// Buckets in the caller's file store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileBucket {
    /// Build artifacts.
    Artifacts,
    /// Service configuration files.
    ConfigFiles,
}

/// Metadata for one stored file.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// Store-assigned id.
    pub file_id: String,
    /// Logical file name.
    pub file_name: String,
    /// Size in bytes.
    pub length: u64,
}

/// Metadata-fetch and byte-stream-open calls into the caller's file store.
///
/// Implemented by the orchestrator, never by this crate.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Fetch metadata for a stored file.
    async fn metadata(
        &self,
        bucket: FileBucket,
        file_id: &str,
        account_id: &str,
    ) -> Result<FileMetadata, TransferError>;

    /// Open the byte stream of a stored file.
    async fn open(
        &self,
        bucket: FileBucket,
        file_id: &str,
        account_id: &str,
    ) -> Result<ByteSource, TransferError>;
}

/// Artifact description handed in by the orchestrator.
///
/// The byte length starts unknown and is resolved lazily - fetched at most
/// once per copy call and cached back here.
#[derive(Debug, Clone, Default)]
pub struct ArtifactMetadata {
    /// Logical artifact file name, possibly carrying a path prefix.
    pub file_name: String,
    /// Size in bytes, once resolved.
    pub length: Option<u64>,
    /// Free-form stream attributes from the artifact source.
    pub attributes: HashMap<String, String>,
}

/// One config file to place on the target.
#[derive(Debug, Clone, Default)]
pub struct ConfigFileMeta {
    /// Store id of the file; blank means nothing to copy.
    pub file_id: String,
    /// Destination file name; blank means nothing to copy.
    pub file_name: String,
    /// Directory on the target to place the file in.
    pub dest_dir: String,
}

impl ConfigFileMeta {
    /// `true` when there is nothing to copy; treated as a no-op success.
    pub fn is_blank(&self) -> bool {
        self.file_id.trim().is_empty() || self.file_name.trim().is_empty()
    }
}

/// Call-scoped capability for one file to transfer: metadata plus a
/// byte-source opener.
#[async_trait]
pub trait FileProvider: Send + Sync {
    /// File name at the destination.
    fn name(&self) -> String;

    /// Size in bytes.
    async fn length(&self) -> Result<u64, TransferError>;

    /// Open the byte stream.
    async fn open(&self) -> Result<ByteSource, TransferError>;
}

/// Provider reading from the local filesystem.
pub struct LocalFileProvider {
    path: PathBuf,
}

impl LocalFileProvider {
    /// Provider for a local path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FileProvider for LocalFileProvider {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }

    async fn length(&self) -> Result<u64, TransferError> {
        let meta = tokio::fs::metadata(&self.path).await.map_err(|e| {
            TransferError::NotFound(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(meta.len())
    }

    async fn open(&self) -> Result<ByteSource, TransferError> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            TransferError::NotFound(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Box::pin(file))
    }
}

/// Provider backed by an entry in the caller's file store.
pub struct StoreFileProvider {
    store: Arc<dyn FileStore>,
    bucket: FileBucket,
    file_id: String,
    account_id: String,
    name: String,
    length: Option<u64>,
}

impl StoreFileProvider {
    /// Provider for a stored file, with the destination name and optionally
    /// pre-resolved length.
    pub fn new(
        store: Arc<dyn FileStore>,
        bucket: FileBucket,
        file_id: impl Into<String>,
        account_id: impl Into<String>,
        name: impl Into<String>,
        length: Option<u64>,
    ) -> Self {
        Self {
            store,
            bucket,
            file_id: file_id.into(),
            account_id: account_id.into(),
            name: name.into(),
            length,
        }
    }
}

#[async_trait]
impl FileProvider for StoreFileProvider {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn length(&self) -> Result<u64, TransferError> {
        if let Some(length) = self.length {
            return Ok(length);
        }
        let meta = self
            .store
            .metadata(self.bucket, &self.file_id, &self.account_id)
            .await?;
        Ok(meta.length)
    }

    async fn open(&self) -> Result<ByteSource, TransferError> {
        self.store
            .open(self.bucket, &self.file_id, &self.account_id)
            .await
    }
}

/// In-memory provider, mainly for tests and generated content.
pub struct BytesFileProvider {
    name: String,
    bytes: Vec<u8>,
}

impl BytesFileProvider {
    /// Provider over an owned buffer.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

#[async_trait]
impl FileProvider for BytesFileProvider {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn length(&self) -> Result<u64, TransferError> {
        Ok(self.bytes.len() as u64)
    }

    async fn open(&self) -> Result<ByteSource, TransferError> {
        Ok(Box::pin(std::io::Cursor::new(self.bytes.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn blank_config_meta_detection() {
        let blank_id = ConfigFileMeta {
            file_id: "  ".into(),
            file_name: "app.config".into(),
            dest_dir: "/opt/app".into(),
        };
        assert!(blank_id.is_blank());

        let blank_name = ConfigFileMeta {
            file_id: "f1".into(),
            file_name: String::new(),
            dest_dir: "/opt/app".into(),
        };
        assert!(blank_name.is_blank());

        let complete = ConfigFileMeta {
            file_id: "f1".into(),
            file_name: "app.config".into(),
            dest_dir: "/opt/app".into(),
        };
        assert!(!complete.is_blank());
    }

    #[tokio::test]
    async fn local_provider_reports_name_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.log");
        tokio::fs::write(&path, b"log line\n").await.unwrap();

        let provider = LocalFileProvider::new(&path);
        assert_eq!(provider.name(), "service.log");
        assert_eq!(provider.length().await.unwrap(), 9);

        let mut stream = provider.open().await.unwrap();
        let mut content = Vec::new();
        stream.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"log line\n");
    }

    #[tokio::test]
    async fn missing_local_file_is_not_found() {
        let provider = LocalFileProvider::new("/definitely/not/here.bin");
        assert!(matches!(
            provider.length().await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bytes_provider_round_trips() {
        let provider = BytesFileProvider::new("inline.txt", b"abc".to_vec());
        assert_eq!(provider.length().await.unwrap(), 3);
        let mut stream = provider.open().await.unwrap();
        let mut content = Vec::new();
        stream.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"abc");
    }
}
