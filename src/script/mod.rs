//! Transport-specific command framing.
//!
//! SSH commands pass through the exec channel largely verbatim; the WinRM
//! command surface has length and character restrictions that require the
//! PowerShell framing in [`powershell`].

pub mod powershell;
