//! Execution-visible logging.
//!
//! Deployment operators read execution logs, not tracing output. Every
//! component in this crate therefore reports progress and failure lines
//! through an [`ExecutionLogSink`] collaborator owned by the caller, in
//! addition to its own `tracing` events. The sink receives the line, a
//! severity, and the interim or final status of the command unit it belongs
//! to.

use std::fmt;

/// Severity of an execution log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        };
        f.write_str(s)
    }
}

/// Status of a command unit as seen in its execution log.
///
/// `Running` is interim; `Success` and `Failure` are final. An
/// [`ExecutionResult`](crate::executor::ExecutionResult) is never mutated
/// after it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandExecutionStatus {
    Running,
    Success,
    Failure,
}

impl fmt::Display for CommandExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandExecutionStatus::Running => "RUNNING",
            CommandExecutionStatus::Success => "SUCCESS",
            CommandExecutionStatus::Failure => "FAILURE",
        };
        f.write_str(s)
    }
}

/// Callback accepting execution log lines.
///
/// Implementations must be cheap and non-blocking; they are invoked inline on
/// the execution path, including once per streamed output line.
pub trait ExecutionLogSink: Send + Sync {
    /// Record one log line at the given level and execution status.
    fn log(&self, line: &str, level: LogLevel, status: CommandExecutionStatus);

    /// Record an informational line.
    fn info(&self, line: &str, status: CommandExecutionStatus) {
        self.log(line, LogLevel::Info, status);
    }

    /// Record a warning line.
    fn warn(&self, line: &str, status: CommandExecutionStatus) {
        self.log(line, LogLevel::Warn, status);
    }

    /// Record an error line.
    fn error(&self, line: &str, status: CommandExecutionStatus) {
        self.log(line, LogLevel::Error, status);
    }
}

/// Sink that forwards execution log lines to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl ExecutionLogSink for TracingLogSink {
    fn log(&self, line: &str, level: LogLevel, status: CommandExecutionStatus) {
        match level {
            LogLevel::Debug => tracing::debug!(status = %status, "{}", line),
            LogLevel::Info => tracing::info!(status = %status, "{}", line),
            LogLevel::Warn => tracing::warn!(status = %status, "{}", line),
            LogLevel::Error | LogLevel::Fatal => {
                tracing::error!(status = %status, "{}", line);
            }
        }
    }
}

/// Sink that discards everything. Useful in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogSink;

impl ExecutionLogSink for NullLogSink {
    fn log(&self, _line: &str, _level: LogLevel, _status: CommandExecutionStatus) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink collecting lines for assertions.
    #[derive(Default)]
    pub struct CollectingSink {
        pub lines: Mutex<Vec<(String, LogLevel, CommandExecutionStatus)>>,
    }

    impl ExecutionLogSink for CollectingSink {
        fn log(&self, line: &str, level: LogLevel, status: CommandExecutionStatus) {
            self.lines
                .lock()
                .unwrap()
                .push((line.to_string(), level, status));
        }
    }

    #[test]
    fn default_helpers_forward_level() {
        let sink = CollectingSink::default();
        sink.info("one", CommandExecutionStatus::Running);
        sink.error("two", CommandExecutionStatus::Failure);

        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines[0].1, LogLevel::Info);
        assert_eq!(lines[1].1, LogLevel::Error);
        assert_eq!(lines[1].2, CommandExecutionStatus::Failure);
    }

    #[test]
    fn display_forms() {
        assert_eq!(LogLevel::Fatal.to_string(), "FATAL");
        assert_eq!(CommandExecutionStatus::Running.to_string(), "RUNNING");
    }
}
