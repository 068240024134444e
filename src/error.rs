//! Error types for capstan.
//!
//! Layer-specific errors ([`SessionError`](crate::connection::SessionError),
//! [`TransferError`](crate::fileservice::TransferError)) bubble up into the
//! crate-level [`Error`] at the executor boundary.

use thiserror::Error;

use crate::connection::SessionError;
use crate::fileservice::TransferError;

/// Result type alias for capstan operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for capstan.
#[derive(Error, Debug)]
pub enum Error {
    /// Session configuration is invalid or incomplete. Fatal; never retried.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Establishing or using a transport session failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Sourcing or transferring file content failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// I/O error outside a specific transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
