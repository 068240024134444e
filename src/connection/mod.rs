//! Transport layer for remote host communication.
//!
//! This module establishes authenticated sessions against deployment targets
//! and exposes them to the executor layer:
//!
//! - **SSH** (via `russh`): password, private-key, and Kerberos credential
//!   modes, plus bastion-host port forwarding for targets that are not
//!   directly reachable. SSH sessions are long-lived and cached per
//!   execution/host pair in [`cache::SessionCache`].
//! - **WinRM** (WS-Management over HTTP/S): NTLM-authenticated shells for
//!   Windows targets. WinRM shells are short-lived and opened per invocation;
//!   they are never pooled.
//!
//! A [`SshSession`](russh::SshSession) obtained from the cache is not
//! internally serialized for concurrent command execution: callers issuing
//! concurrent commands on the same cached session must provide their own
//! locking.

/// Pure authentication-scheme resolution.
pub mod auth;

/// Bastion-host tunneling (local port forwarding through an intermediary).
pub mod bastion;

/// Execution-scoped SSH session cache with liveness probing.
pub mod cache;

/// Session configuration types.
pub mod config;

/// Kerberos ticket-granting-ticket generation.
pub mod kerberos;

/// NTLM message construction for the WinRM transport.
pub mod ntlm;

/// SSH session implementation using russh.
pub mod russh;

/// WinRM session implementation (WS-Management over HTTP).
pub mod winrm;

use thiserror::Error;

/// Errors that can occur while establishing or using a transport session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Could not establish an authenticated session. Carries the underlying
    /// transport failure as text.
    #[error("Session establishment failed for {host}: {message}")]
    Establishment {
        /// Target host
        host: String,
        /// Underlying cause
        message: String,
    },

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed for {user}@{host}: {message}")]
    Authentication {
        /// Username presented
        user: String,
        /// Target host
        host: String,
        /// Underlying cause
        message: String,
    },

    /// Connection or command did not complete within the configured timeout.
    #[error("Operation against {host} timed out after {timeout_ms} ms")]
    Timeout {
        /// Target host
        host: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// A configured private key file does not exist.
    #[error("Key file not found: {path}")]
    KeyFileNotFound {
        /// Path that was checked
        path: String,
    },

    /// The authentication mechanism is not available on this transport.
    #[error("Unsupported authentication mechanism: {0}")]
    UnsupportedAuth(String),

    /// Session configuration is invalid or incomplete. Fatal; never retried.
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    /// Error raised by the SSH library.
    #[error("SSH transport error: {0}")]
    Transport(String),

    /// Opening or driving an execution channel failed.
    #[error("Session channel error: {0}")]
    Channel(String),

    /// The session handle has been closed.
    #[error("Session closed")]
    Closed,

    /// I/O error during session operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

impl From<::russh::Error> for SessionError {
    fn from(err: ::russh::Error) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for SessionError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        SessionError::Channel(format!("SFTP error: {}", err))
    }
}

/// Raw output of one remote command invocation.
///
/// The exit code is `None` when the remote side closed the channel without
/// reporting one.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code reported by the remote shell.
    pub exit_code: Option<i32>,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// `true` when the remote shell reported exit code zero.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_output_success_requires_zero_exit() {
        let ok = CommandOutput {
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(ok.success());

        let failed = CommandOutput {
            exit_code: Some(2),
            ..Default::default()
        };
        assert!(!failed.success());

        let unknown = CommandOutput::default();
        assert!(!unknown.success());
    }
}
