//! Command and file-transfer executors.
//!
//! Executors are the crate's outward surface: the orchestrator asks the
//! [`ExecutorFactory`] for a command executor or file-transfer executor for a
//! session configuration, and the factory composes the right transport
//! (SSH, WinRM, or process-local) with the shared execution-log sink. The
//! factory holds no independent state beyond its collaborators.

/// Process-local execution.
pub mod local;

/// SSH executors.
pub mod ssh;

/// WinRM executors.
pub mod winrm;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::connection::cache::SshSessionCache;
use crate::connection::config::{SshSessionConfig, WinRmSessionConfig};
use crate::error::{Error, Result};
use crate::fileservice::{ArtifactMetadata, ConfigFileMeta, FileBucket, FileStore};
use crate::logging::{CommandExecutionStatus, ExecutionLogSink, LogLevel};

pub use local::LocalExecutorConfig;

/// Outcome of one command invocation or file transfer.
///
/// Produced once and never mutated after return; `Running` appears only on
/// interim log lines, never in a returned result.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Final status.
    pub status: CommandExecutionStatus,
    /// Exit code, when the remote side reported one.
    pub exit_code: Option<i32>,
    /// Accumulated standard output.
    pub stdout: String,
    /// Accumulated standard error.
    pub stderr: String,
}

impl ExecutionResult {
    /// Successful result with the given output.
    pub fn success(exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        Self {
            status: CommandExecutionStatus::Success,
            exit_code,
            stdout,
            stderr,
        }
    }

    /// Failed result with the given output.
    pub fn failure(exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        Self {
            status: CommandExecutionStatus::Failure,
            exit_code,
            stdout,
            stderr,
        }
    }

    /// Failure with no output, for errors before any command ran.
    pub fn failed_before_execution() -> Self {
        Self::failure(None, String::new(), String::new())
    }

    /// `true` when the status is `Success`.
    pub fn is_success(&self) -> bool {
        self.status == CommandExecutionStatus::Success
    }
}

/// Runs one command against a target.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Execute a command (or multi-line script), streaming output to the
    /// execution log and returning the final result. Transport failures are
    /// folded into a `Failure` result after logging; they are not panics.
    async fn execute(&self, command: &str) -> ExecutionResult;
}

/// Copies file content onto a target.
///
/// All operations are fail-fast: the first failing file halts the remaining
/// batch and yields `Failure`.
#[async_trait]
pub trait FileTransferExecutor: Send + Sync {
    /// Copy local files to `dest_dir/<basename>` on the target.
    async fn copy_files(&self, dest_dir: &str, local_paths: &[PathBuf]) -> CommandExecutionStatus;

    /// Copy artifact files by store id. The artifact's byte length is
    /// resolved lazily, at most once per call, and cached into `metadata`;
    /// a path prefix on the logical file name is stripped with a warning.
    async fn copy_artifact_files(
        &self,
        dest_dir: &str,
        metadata: &mut ArtifactMetadata,
        file_ids: &[String],
    ) -> CommandExecutionStatus;

    /// Copy one config file described by `meta`. Blank id or file name is a
    /// no-op success: there is nothing to copy.
    async fn copy_config_files(&self, meta: &ConfigFileMeta) -> CommandExecutionStatus;

    /// Copy stored files `(file_id, rename_to)` one at a time.
    async fn copy_stored_files(
        &self,
        dest_dir: &str,
        bucket: FileBucket,
        files: &[(String, Option<String>)],
    ) -> CommandExecutionStatus;
}

/// Session configuration for one executor, by transport.
#[derive(Debug, Clone)]
pub enum ExecutorConfig {
    /// SSH target.
    Ssh(SshSessionConfig),
    /// WinRM target.
    WinRm(WinRmSessionConfig),
    /// The orchestrator node itself.
    Local(LocalExecutorConfig),
}

/// Execution-log handle shared by all executors: the sink plus the
/// should-persist flag wired by the factory. Tracing events fire regardless;
/// the sink only sees lines when persistence is on.
#[derive(Clone)]
pub(crate) struct ExecLog {
    sink: Arc<dyn ExecutionLogSink>,
    persist: bool,
}

impl ExecLog {
    pub(crate) fn new(sink: Arc<dyn ExecutionLogSink>, persist: bool) -> Self {
        Self { sink, persist }
    }

    pub(crate) fn log(&self, line: &str, level: LogLevel, status: CommandExecutionStatus) {
        if self.persist {
            self.sink.log(line, level, status);
        }
    }

    pub(crate) fn info(&self, line: &str, status: CommandExecutionStatus) {
        tracing::debug!(status = %status, "{}", line);
        self.log(line, LogLevel::Info, status);
    }

    pub(crate) fn warn(&self, line: &str, status: CommandExecutionStatus) {
        tracing::warn!(status = %status, "{}", line);
        self.log(line, LogLevel::Warn, status);
    }

    pub(crate) fn error(&self, line: &str, status: CommandExecutionStatus) {
        tracing::warn!(status = %status, "{}", line);
        self.log(line, LogLevel::Error, status);
    }
}

/// Composition root building executors for session configurations.
pub struct ExecutorFactory {
    cache: Arc<SshSessionCache>,
    store: Arc<dyn FileStore>,
    log_sink: Arc<dyn ExecutionLogSink>,
    should_persist_logs: bool,
}

impl ExecutorFactory {
    /// Build a factory around the shared collaborators.
    pub fn new(
        cache: Arc<SshSessionCache>,
        store: Arc<dyn FileStore>,
        log_sink: Arc<dyn ExecutionLogSink>,
        should_persist_logs: bool,
    ) -> Self {
        Self {
            cache,
            store,
            log_sink,
            should_persist_logs,
        }
    }

    fn exec_log(&self) -> ExecLog {
        ExecLog::new(Arc::clone(&self.log_sink), self.should_persist_logs)
    }

    /// Build the command executor for a configuration.
    pub fn command_executor(&self, config: &ExecutorConfig) -> Result<Box<dyn CommandExecutor>> {
        match config {
            ExecutorConfig::Ssh(ssh) => Ok(Box::new(ssh::SshCommandExecutor::new(
                ssh.clone(),
                Arc::clone(&self.cache),
                self.exec_log(),
            ))),
            ExecutorConfig::WinRm(winrm) => Ok(Box::new(winrm::WinRmCommandExecutor::new(
                winrm.clone(),
                self.exec_log(),
            ))),
            ExecutorConfig::Local(local) => Ok(Box::new(local::LocalCommandExecutor::new(
                local.clone(),
                self.exec_log(),
            ))),
        }
    }

    /// Build the file-transfer executor for a configuration.
    ///
    /// SSH file transfer is cache-scoped, so a missing execution id is a
    /// fatal configuration error rather than a key collision waiting to
    /// happen. The process-local executor has no file-transfer counterpart.
    pub fn file_transfer_executor(
        &self,
        config: &ExecutorConfig,
    ) -> Result<Box<dyn FileTransferExecutor>> {
        match config {
            ExecutorConfig::Ssh(ssh) => {
                if ssh.execution_id.trim().is_empty() {
                    return Err(Error::Config(
                        "SSH file transfer requires an execution id".to_string(),
                    ));
                }
                Ok(Box::new(ssh::SshFileTransferExecutor::new(
                    ssh.clone(),
                    Arc::clone(&self.cache),
                    Arc::clone(&self.store),
                    self.exec_log(),
                )))
            }
            ExecutorConfig::WinRm(winrm) => Ok(Box::new(winrm::WinRmFileTransferExecutor::new(
                winrm.clone(),
                Arc::clone(&self.store),
                self.exec_log(),
            ))),
            ExecutorConfig::Local(_) => Err(Error::Config(
                "file transfer is not available for the process-local executor".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::SshCredentials;
    use crate::fileservice::{ByteSource, FileMetadata, TransferError};
    use crate::logging::NullLogSink;

    struct EmptyStore;

    #[async_trait]
    impl FileStore for EmptyStore {
        async fn metadata(
            &self,
            _bucket: FileBucket,
            file_id: &str,
            _account_id: &str,
        ) -> std::result::Result<FileMetadata, TransferError> {
            Err(TransferError::NotFound(file_id.to_string()))
        }

        async fn open(
            &self,
            _bucket: FileBucket,
            file_id: &str,
            _account_id: &str,
        ) -> std::result::Result<ByteSource, TransferError> {
            Err(TransferError::NotFound(file_id.to_string()))
        }
    }

    fn factory() -> ExecutorFactory {
        ExecutorFactory::new(
            Arc::new(SshSessionCache::default()),
            Arc::new(EmptyStore),
            Arc::new(NullLogSink),
            true,
        )
    }

    fn ssh_config(execution_id: &str) -> SshSessionConfig {
        SshSessionConfig::new(
            "host-a",
            "deploy",
            SshCredentials::Password {
                password: "pw".into(),
            },
        )
        .execution_id(execution_id)
    }

    #[test]
    fn ssh_file_transfer_requires_execution_id() {
        let factory = factory();
        let err = factory
            .file_transfer_executor(&ExecutorConfig::Ssh(ssh_config("")))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));

        assert!(factory
            .file_transfer_executor(&ExecutorConfig::Ssh(ssh_config("exec-1")))
            .is_ok());
    }

    #[test]
    fn local_file_transfer_is_a_config_error() {
        let factory = factory();
        let err = factory
            .file_transfer_executor(&ExecutorConfig::Local(LocalExecutorConfig::default()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn command_executors_build_for_every_transport() {
        let factory = factory();
        assert!(factory
            .command_executor(&ExecutorConfig::Ssh(ssh_config("exec-1")))
            .is_ok());
        assert!(factory
            .command_executor(&ExecutorConfig::WinRm(WinRmSessionConfig::new(
                "win1", "u", "p"
            )))
            .is_ok());
        assert!(factory
            .command_executor(&ExecutorConfig::Local(LocalExecutorConfig::default()))
            .is_ok());
    }

    #[test]
    fn execution_result_constructors_set_status() {
        assert!(ExecutionResult::success(Some(0), String::new(), String::new()).is_success());
        assert!(!ExecutionResult::failure(Some(1), String::new(), String::new()).is_success());
        assert_eq!(
            ExecutionResult::failed_before_execution().status,
            CommandExecutionStatus::Failure
        );
    }
}
