//! # Capstan - Remote Execution for Deployment Orchestration
//!
//! Capstan is the session layer a deployment orchestrator uses to run shell
//! commands and move files onto target hosts. It speaks two incompatible
//! transports - SSH for Linux/Unix fleets and WinRM for Windows - behind a
//! single executor surface, and takes care of the parts that are easy to get
//! wrong: mutually exclusive authentication modes (password, private key,
//! Kerberos, bastion-host port forwarding), caching live sessions across many
//! concurrent executions, framing arbitrary multi-line scripts for a remote
//! shell with length and character restrictions, and streaming file content to
//! a remote filesystem with honest error propagation.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                          │
//! │         (decides WHAT to run; not part of this crate)        │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ExecutorFactory                        │
//! │       (SSH / WinRM / local command + file executors)         │
//! └─────────────────────────────────────────────────────────────┘
//!            │                            │
//!            ▼                            ▼
//! ┌─────────────────────┐   ┌─────────────────────────────────┐
//! │    SessionCache     │   │         ScriptEncoder            │
//! │ (executionId~host,  │   │ (PowerShell framing: encoded or  │
//! │  probe + replace)   │   │  disk-script strategies)         │
//! └─────────────────────┘   └─────────────────────────────────┘
//!            │                            │
//!            ▼                            ▼
//! ┌─────────────────────┐   ┌─────────────────────────────────┐
//! │     SshSession      │   │          WinRmSession            │
//! │ (russh exec/SFTP,   │   │  (WS-Man shells over HTTP with   │
//! │  bastion tunnels)   │   │   NTLM authentication)           │
//! └─────────────────────┘   └─────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use capstan::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = SshSessionConfig::new(
//!         "10.20.0.7",
//!         "deploy",
//!         SshCredentials::KeyFile { path: None, passphrase: None },
//!     )
//!     .execution_id("exec-42")
//!     .account_id("acct-1");
//!
//!     let factory = ExecutorFactory::new(
//!         Arc::new(SshSessionCache::default()),
//!         Arc::new(MyFileStore::connect().await?),
//!         Arc::new(TracingLogSink::default()),
//!         true,
//!     );
//!
//!     let executor = factory.command_executor(&ExecutorConfig::Ssh(config))?;
//!     let result = executor.execute("systemctl restart myservice").await;
//!     println!("exit: {:?}", result.exit_code);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of the types most callers need.

    pub use crate::connection::cache::{SessionCache, SshSessionCache};
    pub use crate::connection::config::{
        AccessType, AuthScheme, KerberosConfig, SshCredentials, SshSessionConfig,
        WinRmAuthScheme, WinRmSessionConfig,
    };
    pub use crate::connection::russh::SshSession;
    pub use crate::connection::winrm::WinRmSession;
    pub use crate::connection::{CommandOutput, SessionError, SessionResult};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{
        CommandExecutor, ExecutionResult, ExecutorConfig, ExecutorFactory, FileTransferExecutor,
        LocalExecutorConfig,
    };
    pub use crate::fileservice::{
        ArtifactMetadata, ConfigFileMeta, FileBucket, FileMetadata, FileProvider, FileStore,
        TransferError,
    };
    pub use crate::logging::{
        CommandExecutionStatus, ExecutionLogSink, LogLevel, NullLogSink, TracingLogSink,
    };
}

/// Error types and result alias for capstan operations.
pub mod error;

/// Execution-visible logging collaborator and levels.
///
/// Every component reports human-readable progress lines through an
/// [`ExecutionLogSink`](logging::ExecutionLogSink) so operators can see why a
/// deployment step failed without digging through internal error values.
pub mod logging;

/// Transport layer: session configuration, authentication resolution, SSH and
/// WinRM sessions, bastion tunnels, and the execution-scoped session cache.
pub mod connection;

/// PowerShell command framing for the WinRM transport.
///
/// WinRM command lines have length and character restrictions, so scripts are
/// either base64-encoded into a single decode-and-run invocation or written
/// line by line to a remote temp file and invoked from disk.
pub mod script;

/// Command and file-transfer executors plus the composition-root factory.
pub mod executor;

/// External collaborator contracts for file and artifact sources.
pub mod fileservice;

/// Returns the current version of capstan.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
