//! WinRM executors.
//!
//! Commands are framed through the PowerShell strategies in
//! [`script::powershell`](crate::script::powershell) before they reach the
//! shell. Bulk file copy is explicitly unsupported on this transport - the
//! operations return a distinct not-implemented failure so callers cannot
//! mistake a skipped copy for success - and only config-file copy is
//! implemented, by materializing bytes remotely through base64 round-trips.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::connection::config::WinRmSessionConfig;
use crate::connection::winrm::WinRmSession;
use crate::connection::{CommandOutput, SessionResult};
use crate::fileservice::{ArtifactMetadata, ConfigFileMeta, FileBucket, FileStore};
use crate::logging::CommandExecutionStatus;
use crate::script::powershell::{
    cleanup_command, disk_script_append_commands, encoded_command, invoke_script_command,
    write_file_commands, EncodingStrategy,
};

use super::{CommandExecutor, ExecLog, ExecutionResult, FileTransferExecutor};

/// Runs PowerShell scripts on a Windows target.
pub struct WinRmCommandExecutor {
    config: WinRmSessionConfig,
    log: ExecLog,
}

impl WinRmCommandExecutor {
    pub(crate) fn new(config: WinRmSessionConfig, log: ExecLog) -> Self {
        Self { config, log }
    }

    /// Run the disk-script strategy: append the script to a remote temp file
    /// in batches, invoke it, then best-effort remove it.
    async fn execute_from_disk(
        &self,
        session: &WinRmSession,
        script: &str,
    ) -> SessionResult<CommandOutput> {
        let script_file = self.config.script_file_path();
        let batches = disk_script_append_commands(script, &script_file);
        for batch in &batches {
            let output = session.execute(&batch.join(";")).await?;
            if !output.success() {
                self.log.error(
                    &format!(
                        "Failed to stage script on target (exit {:?}): {}",
                        output.exit_code, output.stderr
                    ),
                    CommandExecutionStatus::Failure,
                );
                self.cleanup(session, &script_file).await;
                return Ok(output);
            }
        }

        let result = session.execute(&invoke_script_command(&script_file)).await;
        self.cleanup(session, &script_file).await;
        result
    }

    /// Remove the temp script file. Failures are logged and swallowed; a
    /// leftover temp file must never fail the deployment step.
    async fn cleanup(&self, session: &WinRmSession, script_file: &str) {
        let strategy =
            EncodingStrategy::from_disable_flag(self.config.disable_command_encoding);
        match session.execute(&cleanup_command(script_file, strategy)).await {
            Ok(output) if output.success() => {}
            Ok(output) => self.log.warn(
                &format!(
                    "Could not remove temp script {} (exit {:?})",
                    script_file, output.exit_code
                ),
                CommandExecutionStatus::Running,
            ),
            Err(e) => self.log.warn(
                &format!("Could not remove temp script {}: {}", script_file, e),
                CommandExecutionStatus::Running,
            ),
        }
    }

    fn result_from(&self, output: CommandOutput) -> ExecutionResult {
        for line in output.stdout.lines() {
            self.log.info(line, CommandExecutionStatus::Running);
        }
        for line in output.stderr.lines() {
            self.log.error(line, CommandExecutionStatus::Running);
        }
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
}

#[async_trait]
impl CommandExecutor for WinRmCommandExecutor {
    async fn execute(&self, command: &str) -> ExecutionResult {
        let session = match WinRmSession::connect(self.config.clone()) {
            Ok(session) => session,
            Err(e) => {
                self.log.error(
                    &format!(
                        "Could not establish WinRM session to {}: {}",
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

        let strategy =
            EncodingStrategy::from_disable_flag(self.config.disable_command_encoding);
        let outcome = match strategy {
            EncodingStrategy::Encoded => session.execute(&encoded_command(command)).await,
            EncodingStrategy::DiskScript => self.execute_from_disk(&session, command).await,
        };

        match outcome {
            Ok(output) => self.result_from(output),
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

/// File-transfer executor for Windows targets.
pub struct WinRmFileTransferExecutor {
    config: WinRmSessionConfig,
    store: Arc<dyn FileStore>,
    log: ExecLog,
}

impl WinRmFileTransferExecutor {
    pub(crate) fn new(
        config: WinRmSessionConfig,
        store: Arc<dyn FileStore>,
        log: ExecLog,
    ) -> Self {
        Self { config, store, log }
    }

    fn not_implemented(&self, operation: &str) -> CommandExecutionStatus {
        self.log.error(
            &format!("{} is not implemented for WinRM targets", operation),
            CommandExecutionStatus::Failure,
        );
        CommandExecutionStatus::Failure
    }
}

#[async_trait]
impl FileTransferExecutor for WinRmFileTransferExecutor {
    async fn copy_files(
        &self,
        _dest_dir: &str,
        _local_paths: &[PathBuf],
    ) -> CommandExecutionStatus {
        self.not_implemented("Bulk file copy")
    }

    async fn copy_artifact_files(
        &self,
        _dest_dir: &str,
        _metadata: &mut ArtifactMetadata,
        _file_ids: &[String],
    ) -> CommandExecutionStatus {
        self.not_implemented("Artifact copy")
    }

    async fn copy_config_files(&self, meta: &ConfigFileMeta) -> CommandExecutionStatus {
        if meta.is_blank() {
            self.log
                .info("No config file to copy", CommandExecutionStatus::Running);
            return CommandExecutionStatus::Success;
        }

        let content = match self
            .store
            .open(FileBucket::ConfigFiles, &meta.file_id, &self.config.account_id)
            .await
        {
            Ok(mut stream) => {
                let mut bytes = Vec::new();
                if let Err(e) = stream.read_to_end(&mut bytes).await {
                    self.log.error(
                        &format!("Failed to read config file {}: {}", meta.file_id, e),
                        CommandExecutionStatus::Failure,
                    );
                    return CommandExecutionStatus::Failure;
                }
                bytes
            }
            Err(e) => {
                self.log.error(
                    &format!("Failed to open config file {}: {}", meta.file_id, e),
                    CommandExecutionStatus::Failure,
                );
                return CommandExecutionStatus::Failure;
            }
        };

        let session = match WinRmSession::connect(self.config.clone()) {
            Ok(session) => session,
            Err(e) => {
                self.log.error(
                    &format!(
                        "Could not establish WinRM session to {}: {}",
                        self.config.host, e
                    ),
                    CommandExecutionStatus::Failure,
                );
                return CommandExecutionStatus::Failure;
            }
        };

        let dest = format!(
            "{}\\{}",
            meta.dest_dir.trim_end_matches('\\'),
            meta.file_name
        );
        for command in write_file_commands(&dest, &content) {
            match session.execute(&command).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    self.log.error(
                        &format!(
                            "Failed to write {} (exit {:?}): {}",
                            dest, output.exit_code, output.stderr
                        ),
                        CommandExecutionStatus::Failure,
                    );
                    return CommandExecutionStatus::Failure;
                }
                Err(e) => {
                    self.log.error(
                        &format!("Failed to write {}: {}", dest, e),
                        CommandExecutionStatus::Failure,
                    );
                    return CommandExecutionStatus::Failure;
                }
            }
        }

        self.log.info(
            &format!("Successfully copied {} to {}", meta.file_name, meta.dest_dir),
            CommandExecutionStatus::Running,
        );
        CommandExecutionStatus::Success
    }

    async fn copy_stored_files(
        &self,
        _dest_dir: &str,
        _bucket: FileBucket,
        _files: &[(String, Option<String>)],
    ) -> CommandExecutionStatus {
        self.not_implemented("Stored file copy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
        ) -> Result<FileMetadata, TransferError> {
            Err(TransferError::NotFound(file_id.to_string()))
        }

        async fn open(
            &self,
            _bucket: FileBucket,
            file_id: &str,
            _account_id: &str,
        ) -> Result<ByteSource, TransferError> {
            Err(TransferError::NotFound(file_id.to_string()))
        }
    }

    fn executor() -> WinRmFileTransferExecutor {
        WinRmFileTransferExecutor::new(
            WinRmSessionConfig::new("win1", "Administrator", "pw"),
            Arc::new(EmptyStore),
            ExecLog::new(Arc::new(NullLogSink), true),
        )
    }

    #[tokio::test]
    async fn bulk_copies_are_explicit_failures() {
        let executor = executor();
        assert_eq!(
            executor.copy_files("C:\\app", &[PathBuf::from("a")]).await,
            CommandExecutionStatus::Failure
        );
        assert_eq!(
            executor
                .copy_stored_files(
                    "C:\\app",
                    FileBucket::ConfigFiles,
                    &[("g1".to_string(), None)]
                )
                .await,
            CommandExecutionStatus::Failure
        );
        let mut metadata = ArtifactMetadata::default();
        assert_eq!(
            executor
                .copy_artifact_files("C:\\app", &mut metadata, &["a1".to_string()])
                .await,
            CommandExecutionStatus::Failure
        );
    }

    #[tokio::test]
    async fn blank_config_file_is_a_no_op_success() {
        let executor = executor();
        let meta = ConfigFileMeta {
            file_id: String::new(),
            file_name: "app.config".into(),
            dest_dir: "C:\\app".into(),
        };
        // No store access, no session: immediate success.
        assert_eq!(
            executor.copy_config_files(&meta).await,
            CommandExecutionStatus::Success
        );
    }

    #[tokio::test]
    async fn missing_config_file_fails_before_any_session() {
        let executor = executor();
        let meta = ConfigFileMeta {
            file_id: "cfg-404".into(),
            file_name: "app.config".into(),
            dest_dir: "C:\\app".into(),
        };
        assert_eq!(
            executor.copy_config_files(&meta).await,
            CommandExecutionStatus::Failure
        );
    }
}
