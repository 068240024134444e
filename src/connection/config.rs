//! Session configuration types.
//!
//! A session configuration is immutable for the lifetime of one execution. It
//! carries the connection coordinates, exactly one credential mode, the
//! correlation identifiers used in execution logs, and the timeouts that bound
//! every network suspension point.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default WinRM HTTP port.
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Default WinRM HTTPS port.
pub const DEFAULT_WINRM_SSL_PORT: u16 = 5986;

/// Private key tried when no key path is configured.
pub const DEFAULT_KEY_PATH: &str = "~/.ssh/id_rsa";

/// Default timeout for TCP connection establishment (ms).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default read/response timeout for an established session (ms).
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 600_000;

/// How the user escalates (or does not) after login.
///
/// Key-based variants drive authentication-scheme resolution: any of them
/// implies key authentication when no explicit scheme is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessType {
    UserPassword,
    UserPasswordSuAppUser,
    UserPasswordSudoAppUser,
    Key,
    KeySuAppUser,
    KeySudoAppUser,
    Kerberos,
}

impl AccessType {
    /// `true` for the access types that imply key-based authentication.
    pub fn is_key_based(self) -> bool {
        matches!(
            self,
            AccessType::Key | AccessType::KeySuAppUser | AccessType::KeySudoAppUser
        )
    }
}

/// Resolved authentication scheme for an SSH session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthScheme {
    PasswordAuth,
    KeyAuth,
    BastionHost,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthScheme::PasswordAuth => "PASSWORD_AUTH",
            AuthScheme::KeyAuth => "KEY_AUTH",
            AuthScheme::BastionHost => "BASTION_HOST",
        };
        f.write_str(s)
    }
}

/// Kerberos principal configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KerberosConfig {
    /// Principal name without the realm part.
    pub principal: String,
    /// Kerberos realm.
    pub realm: String,
    /// Keytab to authenticate the TGT request with.
    pub keytab_path: Option<PathBuf>,
    /// Password alternative to the keytab.
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Whether to request a fresh ticket-granting ticket before connecting.
    #[serde(default)]
    pub generate_tgt: bool,
}

impl KerberosConfig {
    /// `principal@REALM` as passed to kinit.
    pub fn principal_with_realm(&self) -> String {
        format!("{}@{}", self.principal, self.realm)
    }
}

/// Credential material for an SSH session. Exactly one mode is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SshCredentials {
    /// Username/password authentication.
    Password {
        #[serde(default, skip_serializing)]
        password: String,
    },
    /// Private key supplied as bytes.
    Key {
        #[serde(default, skip_serializing)]
        key: Vec<u8>,
        #[serde(default, skip_serializing)]
        passphrase: Option<String>,
        /// Display name for logs; never interpreted.
        #[serde(default)]
        key_name: Option<String>,
    },
    /// Private key read from a file. `None` falls back to `~/.ssh/id_rsa`;
    /// a `$HOME` token in the path is substituted with the home directory.
    KeyFile {
        path: Option<String>,
        #[serde(default, skip_serializing)]
        passphrase: Option<String>,
    },
    /// Kerberos principal, with optional TGT generation before connecting.
    Kerberos(KerberosConfig),
}

/// Configuration for one SSH session.
///
/// Bastion and Kerberos are mutually exclusive with direct key/password
/// except that a bastion session wraps an independent inner configuration
/// reached through a forwarded local port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSessionConfig {
    /// Target hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login username.
    pub username: String,
    /// Credential material; exactly one mode.
    pub credentials: SshCredentials,
    /// Post-login escalation behavior.
    pub access_type: AccessType,
    /// Resolved authentication scheme. `None` means auto-resolve; see
    /// [`auth::resolve_auth_scheme`](super::auth::resolve_auth_scheme).
    pub auth_scheme: Option<AuthScheme>,
    /// Bastion host to tunnel through, with its own independent credentials.
    pub bastion: Option<Box<SshSessionConfig>>,
    /// TCP connection establishment timeout (ms).
    pub connect_timeout_ms: u64,
    /// Read/response timeout for the established session (ms).
    pub session_timeout_ms: u64,
    /// Execution this session belongs to; scopes the cache key.
    pub execution_id: String,
    /// Correlation id for logs.
    pub account_id: String,
    /// Correlation id for logs.
    pub app_id: String,
    /// Command unit name for logs.
    pub command_unit_name: String,
}

impl SshSessionConfig {
    /// Create a configuration with default port and timeouts.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        credentials: SshCredentials,
    ) -> Self {
        let access_type = match &credentials {
            SshCredentials::Password { .. } => AccessType::UserPassword,
            SshCredentials::Key { .. } | SshCredentials::KeyFile { .. } => AccessType::Key,
            SshCredentials::Kerberos(_) => AccessType::Kerberos,
        };
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            credentials,
            access_type,
            auth_scheme: None,
            bastion: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            execution_id: String::new(),
            account_id: String::new(),
            app_id: String::new(),
            command_unit_name: String::new(),
        }
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the access type.
    pub fn access_type(mut self, access_type: AccessType) -> Self {
        self.access_type = access_type;
        self
    }

    /// Set the bastion sub-configuration.
    pub fn bastion(mut self, bastion: SshSessionConfig) -> Self {
        self.bastion = Some(Box::new(bastion));
        self
    }

    /// Set the execution id.
    pub fn execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = id.into();
        self
    }

    /// Set the account id.
    pub fn account_id(mut self, id: impl Into<String>) -> Self {
        self.account_id = id.into();
        self
    }

    /// Set the application id.
    pub fn app_id(mut self, id: impl Into<String>) -> Self {
        self.app_id = id.into();
        self
    }

    /// Set the command unit name.
    pub fn command_unit_name(mut self, name: impl Into<String>) -> Self {
        self.command_unit_name = name.into();
        self
    }

    /// Set the connection establishment timeout in milliseconds.
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set the session read/response timeout in milliseconds.
    pub fn session_timeout_ms(mut self, ms: u64) -> Self {
        self.session_timeout_ms = ms;
        self
    }

    /// Connection establishment timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Session read/response timeout as a [`Duration`].
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Cache key scoping this session to one execution/host pair.
    pub fn cache_key(&self) -> String {
        format!("{}~{}", self.execution_id, self.host.trim())
    }

    /// `user@host:port` identifier used in logs.
    pub fn identifier(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Authentication mechanism for WinRM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WinRmAuthScheme {
    Ntlm,
    Kerberos,
}

/// Configuration for one WinRM session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinRmSessionConfig {
    /// Target hostname or IP address.
    pub host: String,
    /// WinRM port.
    pub port: u16,
    /// Login username, optionally `DOMAIN\user`.
    pub username: String,
    /// Login password.
    #[serde(default, skip_serializing)]
    pub password: String,
    /// NT domain when not embedded in the username.
    pub domain: Option<String>,
    /// Authentication mechanism.
    pub auth_scheme: WinRmAuthScheme,
    /// Use HTTPS instead of HTTP.
    pub use_ssl: bool,
    /// Accept invalid TLS certificates.
    pub skip_cert_checks: bool,
    /// Remote working directory for temp script files.
    pub working_directory: String,
    /// Environment variables set in the remote shell.
    pub environment: HashMap<String, String>,
    /// Request timeout (ms).
    pub timeout_ms: u64,
    /// Selects the disk-script command framing strategy instead of base64
    /// encoding. See [`script::powershell`](crate::script::powershell).
    pub disable_command_encoding: bool,
    /// Execution this session belongs to.
    pub execution_id: String,
    /// Correlation id for logs.
    pub account_id: String,
    /// Correlation id for logs.
    pub app_id: String,
    /// Command unit name for logs.
    pub command_unit_name: String,
}

impl WinRmSessionConfig {
    /// Create a configuration with default port, timeouts, and working
    /// directory.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_WINRM_PORT,
            username: username.into(),
            password: password.into(),
            domain: None,
            auth_scheme: WinRmAuthScheme::Ntlm,
            use_ssl: false,
            skip_cert_checks: false,
            working_directory: "%TEMP%".to_string(),
            environment: HashMap::new(),
            timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            disable_command_encoding: false,
            execution_id: String::new(),
            account_id: String::new(),
            app_id: String::new(),
            command_unit_name: String::new(),
        }
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enable HTTPS.
    pub fn use_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        if use_ssl && self.port == DEFAULT_WINRM_PORT {
            self.port = DEFAULT_WINRM_SSL_PORT;
        }
        self
    }

    /// Set the execution id.
    pub fn execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = id.into();
        self
    }

    /// Select the disk-script framing strategy.
    pub fn disable_command_encoding(mut self, disable: bool) -> Self {
        self.disable_command_encoding = disable;
        self
    }

    /// The WS-Management endpoint URL.
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}/wsman", scheme, self.host, self.port)
    }

    /// Request timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Path of the per-execution temp script file on the target.
    pub fn script_file_path(&self) -> String {
        format!(
            "{}\\harness-{}.ps1",
            self.working_directory.trim_end_matches('\\'),
            self.execution_id
        )
    }
}

/// Expand a key file path, substituting `~` and `$HOME`, falling back to the
/// default identity file when no path is configured.
pub fn expand_key_path(path: Option<&str>) -> PathBuf {
    let raw = path.unwrap_or(DEFAULT_KEY_PATH);
    let substituted = match dirs::home_dir() {
        Some(home) => raw.replace("$HOME", &home.to_string_lossy()),
        None => raw.to_string(),
    };
    let expanded = shellexpand::tilde(&substituted);
    PathBuf::from(expanded.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cache_key_trims_host() {
        let config = SshSessionConfig::new(
            " app1.internal ",
            "deploy",
            SshCredentials::Password {
                password: "pw".into(),
            },
        )
        .execution_id("exec-7");

        assert_eq!(config.cache_key(), "exec-7~app1.internal");
    }

    #[test]
    fn new_derives_access_type_from_credentials() {
        let key = SshSessionConfig::new(
            "h",
            "u",
            SshCredentials::KeyFile {
                path: None,
                passphrase: None,
            },
        );
        assert_eq!(key.access_type, AccessType::Key);

        let pw = SshSessionConfig::new(
            "h",
            "u",
            SshCredentials::Password {
                password: String::new(),
            },
        );
        assert_eq!(pw.access_type, AccessType::UserPassword);
    }

    #[test]
    fn expand_key_path_substitutes_home_token() {
        let home = dirs::home_dir().expect("home dir in test env");
        let expanded = expand_key_path(Some("$HOME/.ssh/deploy_key"));
        assert_eq!(expanded, home.join(".ssh/deploy_key"));

        let tilde = expand_key_path(None);
        assert_eq!(tilde, home.join(".ssh/id_rsa"));
    }

    #[test]
    fn winrm_ssl_switches_default_port() {
        let config = WinRmSessionConfig::new("win1", "Administrator", "pw").use_ssl(true);
        assert_eq!(config.port, DEFAULT_WINRM_SSL_PORT);
        assert!(config.endpoint_url().starts_with("https://win1:5986"));
    }

    #[test]
    fn script_file_path_is_execution_scoped() {
        let config = WinRmSessionConfig::new("win1", "u", "p").execution_id("abc123");
        assert_eq!(config.script_file_path(), "%TEMP%\\harness-abc123.ps1");
    }

    #[test]
    fn secrets_are_not_serialized() {
        let config = SshSessionConfig::new(
            "h",
            "u",
            SshCredentials::Password {
                password: "hunter2".into(),
            },
        );
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }
}
