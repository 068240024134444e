//! SSH executors.
//!
//! Commands run over exec channels on a cached session; every file operation
//! funnels through one [`RemoteFileSink::put`] primitive so all four copy
//! variants share a single transport implementation (SFTP).

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::connection::cache::SshSessionCache;
use crate::connection::config::SshSessionConfig;
use crate::connection::russh::SshSession;
use crate::fileservice::{
    ArtifactMetadata, ConfigFileMeta, FileBucket, FileProvider, FileStore, LocalFileProvider,
    StoreFileProvider, TransferError,
};
use crate::logging::CommandExecutionStatus;

use super::{CommandExecutor, ExecLog, ExecutionResult, FileTransferExecutor};

/// Runs commands through a cached SSH session.
pub struct SshCommandExecutor {
    config: SshSessionConfig,
    cache: Arc<SshSessionCache>,
    log: ExecLog,
}

impl SshCommandExecutor {
    pub(crate) fn new(
        config: SshSessionConfig,
        cache: Arc<SshSessionCache>,
        log: ExecLog,
    ) -> Self {
        Self { config, cache, log }
    }
}

#[async_trait]
impl CommandExecutor for SshCommandExecutor {
    async fn execute(&self, command: &str) -> ExecutionResult {
        let session = match self.cache.get_or_create(&self.config).await {
            Ok(session) => session,
            Err(e) => {
                self.log.error(
                    &format!(
                        "Could not establish SSH session to {}: {}",
                        self.config.host, e
                    ),
                    CommandExecutionStatus::Failure,
                );
                return ExecutionResult::failed_before_execution();
            }
        };

        self.log.info(
            &format!("Executing command on {}", self.config.host),
            CommandExecutionStatus::Running,
        );

        let log = self.log.clone();
        let outcome = session
            .exec_with(command, |line, is_stderr| {
                if is_stderr {
                    log.error(line, CommandExecutionStatus::Running);
                } else {
                    log.info(line, CommandExecutionStatus::Running);
                }
            })
            .await;

        match outcome {
            Ok(output) => {
                if output.success() {
                    self.log
                        .info("Command completed", CommandExecutionStatus::Success);
                    ExecutionResult::success(output.exit_code, output.stdout, output.stderr)
                } else {
                    self.log.error(
                        &format!("Command failed with exit code {:?}", output.exit_code),
                        CommandExecutionStatus::Failure,
                    );
                    ExecutionResult::failure(output.exit_code, output.stdout, output.stderr)
                }
            }
            Err(e) => {
                self.log.error(
                    &format!("Command execution failed: {}", e),
                    CommandExecutionStatus::Failure,
                );
                ExecutionResult::failed_before_execution()
            }
        }
    }
}

/// The single transport primitive every copy operation funnels through.
#[async_trait]
pub trait RemoteFileSink: Send + Sync {
    /// Stream one provider's bytes to `dest_dir/<provider name>`.
    async fn put(
        &self,
        dest_dir: &str,
        provider: &dyn FileProvider,
    ) -> Result<(), TransferError>;
}

/// SFTP-backed sink over a live SSH session.
pub struct SftpFileSink {
    session: Arc<SshSession>,
}

impl SftpFileSink {
    /// Sink writing through the given session.
    pub fn new(session: Arc<SshSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl RemoteFileSink for SftpFileSink {
    async fn put(
        &self,
        dest_dir: &str,
        provider: &dyn FileProvider,
    ) -> Result<(), TransferError> {
        let name = provider.name();
        let dest = join_remote_path(dest_dir, &name);
        let length = provider.length().await?;
        debug!(dest = %dest, length, "Streaming file over SFTP");

        let mut source = provider.open().await?;
        let sftp = self.session.open_sftp().await?;
        let mut remote = sftp.create(&dest).await.map_err(|e| {
            TransferError::Transfer(format!("failed to create remote file {}: {}", dest, e))
        })?;

        tokio::io::copy(&mut source, &mut remote)
            .await
            .map_err(|e| {
                TransferError::Transfer(format!("failed to write remote file {}: {}", dest, e))
            })?;
        remote.flush().await.map_err(|e| {
            TransferError::Transfer(format!("failed to flush remote file {}: {}", dest, e))
        })?;
        drop(remote);

        Ok(())
    }
}

/// Join a destination directory and file name with a forward slash.
fn join_remote_path(dest_dir: &str, name: &str) -> String {
    format!("{}/{}", dest_dir.trim_end_matches('/'), name)
}

/// Transport-independent copy logic shared by the four operations.
///
/// Everything here is fail-fast: the first failing file short-circuits the
/// batch, and files after it are never opened.
pub(crate) struct FileTransferCore {
    store: Arc<dyn FileStore>,
    account_id: String,
    log: ExecLog,
}

impl FileTransferCore {
    pub(crate) fn new(store: Arc<dyn FileStore>, account_id: String, log: ExecLog) -> Self {
        Self {
            store,
            account_id,
            log,
        }
    }

    async fn copy_providers(
        &self,
        sink: &dyn RemoteFileSink,
        dest_dir: &str,
        providers: Vec<Box<dyn FileProvider>>,
    ) -> CommandExecutionStatus {
        for provider in providers {
            let name = provider.name();
            match sink.put(dest_dir, provider.as_ref()).await {
                Ok(()) => self.log.info(
                    &format!("Successfully copied {} to {}", name, dest_dir),
                    CommandExecutionStatus::Running,
                ),
                Err(e) => {
                    self.log.error(
                        &format!("Failed to copy {} to {}: {}", name, dest_dir, e),
                        CommandExecutionStatus::Failure,
                    );
                    return CommandExecutionStatus::Failure;
                }
            }
        }
        CommandExecutionStatus::Success
    }

    pub(crate) async fn copy_local_files(
        &self,
        sink: &dyn RemoteFileSink,
        dest_dir: &str,
        local_paths: &[PathBuf],
    ) -> CommandExecutionStatus {
        let providers: Vec<Box<dyn FileProvider>> = local_paths
            .iter()
            .map(|p| Box::new(LocalFileProvider::new(p)) as Box<dyn FileProvider>)
            .collect();
        self.copy_providers(sink, dest_dir, providers).await
    }

    pub(crate) async fn copy_artifact_files(
        &self,
        sink: &dyn RemoteFileSink,
        dest_dir: &str,
        metadata: &mut ArtifactMetadata,
        file_ids: &[String],
    ) -> CommandExecutionStatus {
        // The artifact length is fetched at most once per call and cached
        // back onto the metadata for subsequent calls.
        if metadata.length.is_none() {
            if let Some(first_id) = file_ids.first() {
                match self
                    .store
                    .metadata(FileBucket::Artifacts, first_id, &self.account_id)
                    .await
                {
                    Ok(meta) => metadata.length = Some(meta.length),
                    Err(e) => {
                        self.log.error(
                            &format!("Failed to resolve artifact size: {}", e),
                            CommandExecutionStatus::Failure,
                        );
                        return CommandExecutionStatus::Failure;
                    }
                }
            }
        }

        let name = strip_path_prefix(&metadata.file_name);
        if name != metadata.file_name {
            self.log.warn(
                &format!(
                    "Artifact file name {} truncated to {}",
                    metadata.file_name, name
                ),
                CommandExecutionStatus::Running,
            );
        }

        let providers: Vec<Box<dyn FileProvider>> = file_ids
            .iter()
            .map(|id| {
                Box::new(StoreFileProvider::new(
                    Arc::clone(&self.store),
                    FileBucket::Artifacts,
                    id,
                    &self.account_id,
                    &name,
                    metadata.length,
                )) as Box<dyn FileProvider>
            })
            .collect();
        self.copy_providers(sink, dest_dir, providers).await
    }

    pub(crate) async fn copy_config_files(
        &self,
        sink: &dyn RemoteFileSink,
        meta: &ConfigFileMeta,
    ) -> CommandExecutionStatus {
        if meta.is_blank() {
            self.log.info(
                "No config file to copy",
                CommandExecutionStatus::Running,
            );
            return CommandExecutionStatus::Success;
        }
        let provider = StoreFileProvider::new(
            Arc::clone(&self.store),
            FileBucket::ConfigFiles,
            &meta.file_id,
            &self.account_id,
            &meta.file_name,
            None,
        );
        self.copy_providers(sink, &meta.dest_dir, vec![Box::new(provider)])
            .await
    }

    pub(crate) async fn copy_stored_files(
        &self,
        sink: &dyn RemoteFileSink,
        dest_dir: &str,
        bucket: FileBucket,
        files: &[(String, Option<String>)],
    ) -> CommandExecutionStatus {
        for (file_id, rename_to) in files {
            let name = match rename_to {
                Some(name) => name.clone(),
                None => match self.store.metadata(bucket, file_id, &self.account_id).await {
                    Ok(meta) => meta.file_name,
                    Err(e) => {
                        self.log.error(
                            &format!("Failed to resolve stored file {}: {}", file_id, e),
                            CommandExecutionStatus::Failure,
                        );
                        return CommandExecutionStatus::Failure;
                    }
                },
            };
            let provider = StoreFileProvider::new(
                Arc::clone(&self.store),
                bucket,
                file_id,
                &self.account_id,
                name,
                None,
            );
            let status = self
                .copy_providers(sink, dest_dir, vec![Box::new(provider)])
                .await;
            if status != CommandExecutionStatus::Success {
                return status;
            }
        }
        CommandExecutionStatus::Success
    }
}

/// Strip any path-separator prefix from a logical file name.
fn strip_path_prefix(file_name: &str) -> String {
    file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name)
        .to_string()
}

/// File-transfer executor over a cached SSH session.
pub struct SshFileTransferExecutor {
    config: SshSessionConfig,
    cache: Arc<SshSessionCache>,
    core: FileTransferCore,
    log: ExecLog,
}

impl SshFileTransferExecutor {
    pub(crate) fn new(
        config: SshSessionConfig,
        cache: Arc<SshSessionCache>,
        store: Arc<dyn FileStore>,
        log: ExecLog,
    ) -> Self {
        let core = FileTransferCore::new(store, config.account_id.clone(), log.clone());
        Self {
            config,
            cache,
            core,
            log,
        }
    }

    async fn sink(&self) -> Option<SftpFileSink> {
        match self.cache.get_or_create(&self.config).await {
            Ok(session) => Some(SftpFileSink::new(session)),
            Err(e) => {
                self.log.error(
                    &format!(
                        "Could not establish SSH session to {}: {}",
                        self.config.host, e
                    ),
                    CommandExecutionStatus::Failure,
                );
                None
            }
        }
    }
}

#[async_trait]
impl FileTransferExecutor for SshFileTransferExecutor {
    async fn copy_files(&self, dest_dir: &str, local_paths: &[PathBuf]) -> CommandExecutionStatus {
        let Some(sink) = self.sink().await else {
            return CommandExecutionStatus::Failure;
        };
        self.core.copy_local_files(&sink, dest_dir, local_paths).await
    }

    async fn copy_artifact_files(
        &self,
        dest_dir: &str,
        metadata: &mut ArtifactMetadata,
        file_ids: &[String],
    ) -> CommandExecutionStatus {
        let Some(sink) = self.sink().await else {
            return CommandExecutionStatus::Failure;
        };
        self.core
            .copy_artifact_files(&sink, dest_dir, metadata, file_ids)
            .await
    }

    async fn copy_config_files(&self, meta: &ConfigFileMeta) -> CommandExecutionStatus {
        // A blank config entry never needs a session.
        if meta.is_blank() {
            self.log.info(
                "No config file to copy",
                CommandExecutionStatus::Running,
            );
            return CommandExecutionStatus::Success;
        }
        let Some(sink) = self.sink().await else {
            return CommandExecutionStatus::Failure;
        };
        self.core.copy_config_files(&sink, meta).await
    }

    async fn copy_stored_files(
        &self,
        dest_dir: &str,
        bucket: FileBucket,
        files: &[(String, Option<String>)],
    ) -> CommandExecutionStatus {
        let Some(sink) = self.sink().await else {
            return CommandExecutionStatus::Failure;
        };
        self.core
            .copy_stored_files(&sink, dest_dir, bucket, files)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileservice::{ByteSource, FileMetadata};
    use crate::logging::NullLogSink;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Sink recording puts and failing on configured names.
    #[derive(Default)]
    struct RecordingSink {
        puts: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl RemoteFileSink for RecordingSink {
        async fn put(
            &self,
            _dest_dir: &str,
            provider: &dyn FileProvider,
        ) -> Result<(), TransferError> {
            let name = provider.name();
            // Pull the stream like a real transport would, so failing
            // providers fail here.
            let _ = provider.open().await?;
            self.puts.lock().unwrap().push(name.clone());
            match &self.fail_on {
                Some(fail) if *fail == name => {
                    Err(TransferError::Transfer(format!("injected failure on {}", name)))
                }
                _ => Ok(()),
            }
        }
    }

    /// Store serving fixed content and counting accesses.
    #[derive(Default)]
    struct FakeStore {
        files: HashMap<String, (String, Vec<u8>)>,
        metadata_calls: AtomicUsize,
        open_calls: Mutex<Vec<String>>,
        fail_open_on: Option<String>,
    }

    impl FakeStore {
        fn with_file(mut self, id: &str, name: &str, bytes: &[u8]) -> Self {
            self.files
                .insert(id.to_string(), (name.to_string(), bytes.to_vec()));
            self
        }
    }

    #[async_trait]
    impl FileStore for FakeStore {
        async fn metadata(
            &self,
            _bucket: FileBucket,
            file_id: &str,
            _account_id: &str,
        ) -> Result<FileMetadata, TransferError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            let (name, bytes) = self
                .files
                .get(file_id)
                .ok_or_else(|| TransferError::NotFound(file_id.to_string()))?;
            Ok(FileMetadata {
                file_id: file_id.to_string(),
                file_name: name.clone(),
                length: bytes.len() as u64,
            })
        }

        async fn open(
            &self,
            _bucket: FileBucket,
            file_id: &str,
            _account_id: &str,
        ) -> Result<ByteSource, TransferError> {
            self.open_calls.lock().unwrap().push(file_id.to_string());
            if self.fail_open_on.as_deref() == Some(file_id) {
                return Err(TransferError::Transfer(format!(
                    "injected stream failure on {}",
                    file_id
                )));
            }
            let (_, bytes) = self
                .files
                .get(file_id)
                .ok_or_else(|| TransferError::NotFound(file_id.to_string()))?;
            Ok(Box::pin(std::io::Cursor::new(bytes.clone())))
        }
    }

    fn core_with(store: FakeStore) -> (FileTransferCore, Arc<FakeStore>) {
        let store = Arc::new(store);
        let core = FileTransferCore::new(
            Arc::clone(&store) as Arc<dyn FileStore>,
            "acct-1".to_string(),
            ExecLog::new(Arc::new(NullLogSink), true),
        );
        (core, store)
    }

    #[tokio::test]
    async fn local_batch_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        for p in [&a, &c] {
            tokio::fs::write(p, b"ok").await.unwrap();
        }
        // "b" does not exist, so its stream open raises.

        let (core, _) = core_with(FakeStore::default());
        let sink = RecordingSink::default();
        let status = core
            .copy_local_files(&sink, "/opt/app", &[a, b, c])
            .await;

        assert_eq!(status, CommandExecutionStatus::Failure);
        // "c" is never attempted after "b" fails.
        assert_eq!(*sink.puts.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn sink_failure_short_circuits_batch() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("service.log");
        std::fs::write(&log, b"log").unwrap();
        let paths: Vec<PathBuf> = ["a", "b", "c"]
            .iter()
            .map(|n| {
                let p = dir.path().join(n);
                std::fs::write(&p, b"ok").unwrap();
                p
            })
            .collect();

        let (core, _) = core_with(FakeStore::default());
        let sink = RecordingSink {
            fail_on: Some("b".to_string()),
            ..Default::default()
        };

        // A first successful call leaves no residue on the second.
        let status = core
            .copy_local_files(&sink, "/opt/app", std::slice::from_ref(&log))
            .await;
        assert_eq!(status, CommandExecutionStatus::Success);

        let status = core.copy_local_files(&sink, "/opt/app", &paths).await;
        assert_eq!(status, CommandExecutionStatus::Failure);
        assert_eq!(
            *sink.puts.lock().unwrap(),
            vec!["service.log".to_string(), "a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn blank_config_file_is_a_no_op_success() {
        let (core, store) = core_with(FakeStore::default());
        let sink = RecordingSink::default();

        let meta = ConfigFileMeta {
            file_id: String::new(),
            file_name: "app.config".into(),
            dest_dir: "/opt/app".into(),
        };
        let status = core.copy_config_files(&sink, &meta).await;

        assert_eq!(status, CommandExecutionStatus::Success);
        assert!(sink.puts.lock().unwrap().is_empty());
        assert!(store.open_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn config_file_copy_streams_from_the_store() {
        let (core, store) =
            core_with(FakeStore::default().with_file("cfg-1", "app.config", b"k=v"));
        let sink = RecordingSink::default();

        let meta = ConfigFileMeta {
            file_id: "cfg-1".into(),
            file_name: "app.config".into(),
            dest_dir: "/opt/app".into(),
        };
        let status = core.copy_config_files(&sink, &meta).await;

        assert_eq!(status, CommandExecutionStatus::Success);
        assert_eq!(*sink.puts.lock().unwrap(), vec!["app.config".to_string()]);
        assert_eq!(*store.open_calls.lock().unwrap(), vec!["cfg-1".to_string()]);
    }

    #[tokio::test]
    async fn artifact_size_is_resolved_once_and_cached() {
        let (core, store) =
            core_with(FakeStore::default().with_file("art-1", "service.jar", b"bytes"));
        let sink = RecordingSink::default();

        let mut metadata = ArtifactMetadata {
            file_name: "service.jar".into(),
            length: None,
            attributes: HashMap::new(),
        };
        let status = core
            .copy_artifact_files(&sink, "/opt/app", &mut metadata, &["art-1".to_string()])
            .await;

        assert_eq!(status, CommandExecutionStatus::Success);
        assert_eq!(metadata.length, Some(5));
        assert_eq!(store.metadata_calls.load(Ordering::SeqCst), 1);

        // Second call reuses the cached length.
        let status = core
            .copy_artifact_files(&sink, "/opt/app", &mut metadata, &["art-1".to_string()])
            .await;
        assert_eq!(status, CommandExecutionStatus::Success);
        assert_eq!(store.metadata_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn artifact_path_prefix_is_stripped() {
        let (core, _) =
            core_with(FakeStore::default().with_file("art-1", "ignored", b"bytes"));
        let sink = RecordingSink::default();

        let mut metadata = ArtifactMetadata {
            file_name: "builds/42/service.jar".into(),
            length: Some(5),
            attributes: HashMap::new(),
        };
        core.copy_artifact_files(&sink, "/opt/app", &mut metadata, &["art-1".to_string()])
            .await;

        assert_eq!(*sink.puts.lock().unwrap(), vec!["service.jar".to_string()]);
    }

    #[tokio::test]
    async fn stored_files_fail_fast_and_honor_renames() {
        let store = FakeStore::default()
            .with_file("g1", "one.txt", b"1")
            .with_file("g2", "two.txt", b"2")
            .with_file("g3", "three.txt", b"3");
        let (core, store) = {
            let mut s = store;
            s.fail_open_on = Some("g2".to_string());
            core_with(s)
        };
        let sink = RecordingSink::default();

        let files = vec![
            ("g1".to_string(), Some("renamed.txt".to_string())),
            ("g2".to_string(), None),
            ("g3".to_string(), None),
        ];
        let status = core
            .copy_stored_files(&sink, "/opt/app", FileBucket::ConfigFiles, &files)
            .await;

        assert_eq!(status, CommandExecutionStatus::Failure);
        assert_eq!(*sink.puts.lock().unwrap(), vec!["renamed.txt".to_string()]);
        // g3 is never requested after g2 fails.
        let opened = store.open_calls.lock().unwrap();
        assert!(!opened.contains(&"g3".to_string()));
    }

    #[test]
    fn strip_path_prefix_handles_both_separators() {
        assert_eq!(strip_path_prefix("builds/1/app.jar"), "app.jar");
        assert_eq!(strip_path_prefix("builds\\1\\app.jar"), "app.jar");
        assert_eq!(strip_path_prefix("app.jar"), "app.jar");
    }

    #[test]
    fn join_remote_path_normalizes_trailing_slash() {
        assert_eq!(join_remote_path("/opt/app/", "a.txt"), "/opt/app/a.txt");
        assert_eq!(join_remote_path("/opt/app", "a.txt"), "/opt/app/a.txt");
    }
}
