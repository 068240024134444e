//! Process-local execution.
//!
//! Some deployment steps run on the orchestrator node itself rather than a
//! remote target. The local executor offers the same [`CommandExecutor`]
//! surface over `sh -c`, so callers never branch on where a command runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::logging::CommandExecutionStatus;

use super::{CommandExecutor, ExecLog, ExecutionResult};

/// Configuration for process-local execution.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutorConfig {
    /// Working directory for spawned commands.
    pub working_directory: Option<String>,
    /// Environment variables for spawned commands.
    pub environment: HashMap<String, String>,
    /// Wall-clock bound for one command; `None` runs unbounded.
    pub timeout_ms: Option<u64>,
    /// Execution this step belongs to, for logs.
    pub execution_id: String,
    /// Command unit name for logs.
    pub command_unit_name: String,
}

/// Runs commands on the orchestrator node through `sh -c`.
pub struct LocalCommandExecutor {
    config: LocalExecutorConfig,
    log: ExecLog,
}

impl LocalCommandExecutor {
    pub(crate) fn new(config: LocalExecutorConfig, log: ExecLog) -> Self {
        Self { config, log }
    }

    fn build_command(&self, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(cwd) = &self.config.working_directory {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.config.environment {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

#[async_trait]
impl CommandExecutor for LocalCommandExecutor {
    async fn execute(&self, command: &str) -> ExecutionResult {
        debug!(command = %command, "Executing local command");
        let mut cmd = self.build_command(command);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.log.error(
                    &format!("Failed to spawn local command: {}", e),
                    CommandExecutionStatus::Failure,
                );
                return ExecutionResult::failed_before_execution();
            }
        };

        let waited = match self.config.timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), child.wait_with_output())
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        self.log.error(
                            &format!("Local command timed out after {} ms", ms),
                            CommandExecutionStatus::Failure,
                        );
                        return ExecutionResult::failed_before_execution();
                    }
                }
            }
            None => child.wait_with_output().await,
        };

        let output = match waited {
            Ok(output) => output,
            Err(e) => {
                self.log.error(
                    &format!("Failed to wait for local command: {}", e),
                    CommandExecutionStatus::Failure,
                );
                return ExecutionResult::failed_before_execution();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        for line in stdout.lines() {
            self.log.info(line, CommandExecutionStatus::Running);
        }
        for line in stderr.lines() {
            self.log.error(line, CommandExecutionStatus::Running);
        }

        let exit_code = output.status.code();
        if output.status.success() {
            self.log
                .info("Command completed", CommandExecutionStatus::Success);
            ExecutionResult::success(exit_code, stdout, stderr)
        } else {
            self.log.error(
                &format!("Command failed with exit code {:?}", exit_code),
                CommandExecutionStatus::Failure,
            );
            ExecutionResult::failure(exit_code, stdout, stderr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::NullLogSink;
    use std::sync::Arc;

    fn executor(config: LocalExecutorConfig) -> LocalCommandExecutor {
        LocalCommandExecutor::new(config, ExecLog::new(Arc::new(NullLogSink), true))
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = executor(LocalExecutorConfig::default())
            .execute("echo hello")
            .await;
        assert!(result.is_success());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let result = executor(LocalExecutorConfig::default())
            .execute("exit 3")
            .await;
        assert!(!result.is_success());
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn environment_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = LocalExecutorConfig {
            working_directory: Some(dir.path().to_string_lossy().into_owned()),
            environment: [("CAPSTAN_TEST_VAR".to_string(), "42".to_string())].into(),
            ..Default::default()
        };
        let result = executor(config).execute("echo $CAPSTAN_TEST_VAR; pwd").await;
        assert!(result.is_success());
        assert!(result.stdout.contains("42"));
    }

    #[tokio::test]
    async fn timeout_bounds_the_command() {
        let config = LocalExecutorConfig {
            timeout_ms: Some(100),
            ..Default::default()
        };
        let result = executor(config).execute("sleep 5").await;
        assert!(!result.is_success());
    }
}
