//! SSH session implementation using russh.
//!
//! One [`SshSession`] wraps a connected russh client handle. Commands run
//! over short-lived exec channels opened against the shared handle, so a
//! session survives any number of invocations; file transfer opens SFTP
//! channels against the same handle.
//!
//! Transport hardening applied to every session regardless of credential
//! mode: strict host-key checking is disabled (deployment targets are
//! provisioned and torn down too frequently for known_hosts to be useful), a
//! keep-alive probe runs every 10 seconds, and both connection establishment
//! and channel reads are bounded by the configured timeouts.

use async_trait::async_trait;
use russh::client::{self, Handle, Handler};
use russh::keys::key::{KeyPair, PublicKey};
use russh::keys::{decode_secret_key, load_secret_key};
use russh::{ChannelMsg, Disconnect};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::auth;
use super::bastion::{self, BastionTunnel};
use super::config::{expand_key_path, AuthScheme, SshCredentials, SshSessionConfig};
use super::kerberos;
use super::{CommandOutput, SessionError, SessionResult};

/// Idle keep-alive probe interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Callback consulted for the password when a password-mode configuration
/// carries none. Receives the session identifier being authenticated.
pub type InteractivePasswordPrompt = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Client handler accepting every server key.
///
/// Strict host-key checking is intentionally disabled for all sessions; see
/// the module documentation.
pub(crate) struct ClientHandler;

#[async_trait]
impl Handler for ClientHandler {
    type Error = SessionError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A live, authenticated SSH session to one remote host.
///
/// Not internally serialized for concurrent command execution; callers
/// issuing concurrent commands on the same session must provide their own
/// locking.
pub struct SshSession {
    /// `user@host:port` identifier used in logs.
    identifier: String,
    /// Target host, for error reporting.
    host: String,
    /// Russh client handle. Read lock: channel opens. Write lock: close.
    handle: Arc<RwLock<Option<Handle<ClientHandler>>>>,
    /// Whether the session is believed connected.
    connected: Arc<AtomicBool>,
    /// Read/response timeout applied to each command.
    session_timeout: Duration,
    /// Background keep-alive prober.
    keepalive: JoinHandle<()>,
    /// Keeps the bastion session and forwarder alive for tunneled sessions.
    tunnel: Option<BastionTunnel>,
}

impl SshSession {
    /// Open an authenticated session for the given configuration.
    ///
    /// Dispatches on the resolved authentication scheme; a bastion
    /// configuration opens the tunnel first and returns only the inner
    /// session.
    pub async fn open(config: &SshSessionConfig) -> SessionResult<Self> {
        Self::open_with_prompt(config, None).await
    }

    /// Like [`open`](Self::open), with a pluggable prompt for password-only
    /// configurations that carry no password material.
    pub async fn open_with_prompt(
        config: &SshSessionConfig,
        prompt: Option<InteractivePasswordPrompt>,
    ) -> SessionResult<Self> {
        let scheme = auth::resolve_auth_scheme(config)?;
        auth::check_scheme_supported(config, scheme)?;
        match scheme {
            AuthScheme::BastionHost => bastion::open_through_bastion(config, prompt).await,
            AuthScheme::KeyAuth | AuthScheme::PasswordAuth => {
                Self::open_direct(config, &config.host, config.port, None, prompt).await
            }
        }
    }

    /// Open a session against an explicit endpoint using the configuration's
    /// credentials. The bastion path calls this against the forwarded local
    /// port.
    pub(crate) async fn open_direct(
        config: &SshSessionConfig,
        host: &str,
        port: u16,
        tunnel: Option<BastionTunnel>,
        prompt: Option<InteractivePasswordPrompt>,
    ) -> SessionResult<Self> {
        let identifier = config.identifier();
        debug!(identifier = %identifier, endpoint = %format!("{}:{}", host, port), "Opening SSH session");

        let mut handle = Self::connect_transport(
            host,
            port,
            config.connect_timeout(),
            config.session_timeout(),
        )
        .await?;

        Self::authenticate(&mut handle, config, prompt).await?;

        let handle = Arc::new(RwLock::new(Some(handle)));
        let connected = Arc::new(AtomicBool::new(true));
        let keepalive =
            Self::spawn_keepalive(Arc::clone(&handle), Arc::clone(&connected), identifier.clone());

        debug!(identifier = %identifier, "SSH session established");
        Ok(Self {
            identifier,
            host: config.host.clone(),
            handle,
            connected,
            session_timeout: config.session_timeout(),
            keepalive,
            tunnel,
        })
    }

    /// TCP connect, TCP_NODELAY, SSH handshake.
    async fn connect_transport(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        session_timeout: Duration,
    ) -> SessionResult<Handle<ClientHandler>> {
        let mut config = client::Config::default();
        config.inactivity_timeout = Some(session_timeout);
        let config = Arc::new(config);

        let addr = format!("{}:{}", host, port);
        let socket = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SessionError::Timeout {
                host: host.to_string(),
                timeout_ms: connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| SessionError::Establishment {
                host: host.to_string(),
                message: format!("failed to connect to {}: {}", addr, e),
            })?;

        socket.set_nodelay(true).map_err(|e| SessionError::Establishment {
            host: host.to_string(),
            message: format!("failed to set TCP_NODELAY: {}", e),
        })?;

        client::connect_stream(config, socket, ClientHandler)
            .await
            .map_err(|e| SessionError::Establishment {
                host: host.to_string(),
                message: format!("SSH handshake failed: {}", e),
            })
    }

    /// Authenticate according to the configured credential mode.
    async fn authenticate(
        session: &mut Handle<ClientHandler>,
        config: &SshSessionConfig,
        prompt: Option<InteractivePasswordPrompt>,
    ) -> SessionResult<()> {
        let user = config.username.clone();
        let host = config.host.clone();

        match &config.credentials {
            SshCredentials::Password { password } => {
                let password = if password.is_empty() {
                    prompt
                        .and_then(|p| p(&config.identifier()))
                        .ok_or_else(|| SessionError::Authentication {
                            user: user.clone(),
                            host: host.clone(),
                            message: "no password configured and no interactive prompt available"
                                .to_string(),
                        })?
                } else {
                    password.clone()
                };

                let authenticated = session
                    .authenticate_password(&user, &password)
                    .await
                    .map_err(|e| SessionError::Authentication {
                        user: user.clone(),
                        host: host.clone(),
                        message: format!("password authentication failed: {}", e),
                    })?;
                if authenticated {
                    debug!(user = %user, "Authenticated using password");
                    Ok(())
                } else {
                    Err(SessionError::Authentication {
                        user,
                        host,
                        message: "password rejected by server".to_string(),
                    })
                }
            }
            SshCredentials::Key {
                key,
                passphrase,
                key_name,
            } => {
                let pem = std::str::from_utf8(key).map_err(|_| {
                    SessionError::InvalidConfig(
                        "private key bytes are not valid UTF-8".to_string(),
                    )
                })?;
                let key_pair =
                    decode_secret_key(pem, passphrase.as_deref()).map_err(|e| {
                        SessionError::Authentication {
                            user: user.clone(),
                            host: host.clone(),
                            message: format!(
                                "failed to decode private key {}: {}",
                                key_name.as_deref().unwrap_or("<inline>"),
                                e
                            ),
                        }
                    })?;
                Self::authenticate_with_key(session, &user, &host, key_pair).await
            }
            SshCredentials::KeyFile { path, passphrase } => {
                let key_path = expand_key_path(path.as_deref());
                if !key_path.exists() {
                    return Err(SessionError::KeyFileNotFound {
                        path: key_path.display().to_string(),
                    });
                }
                let key_pair =
                    load_secret_key(&key_path, passphrase.as_deref()).map_err(|e| {
                        SessionError::Authentication {
                            user: user.clone(),
                            host: host.clone(),
                            message: format!(
                                "failed to load key {}: {}",
                                key_path.display(),
                                e
                            ),
                        }
                    })?;
                Self::authenticate_with_key(session, &user, &host, key_pair).await
            }
            SshCredentials::Kerberos(krb) => {
                if krb.generate_tgt {
                    kerberos::generate_tgt(krb).await?;
                }
                // russh has no gssapi-with-mic userauth; surfaced as a typed
                // error rather than silently falling back to another mode.
                Err(SessionError::UnsupportedAuth(
                    "gssapi-with-mic is not available on this SSH backend".to_string(),
                ))
            }
        }
    }

    async fn authenticate_with_key(
        session: &mut Handle<ClientHandler>,
        user: &str,
        host: &str,
        key_pair: KeyPair,
    ) -> SessionResult<()> {
        let authenticated = session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| SessionError::Authentication {
                user: user.to_string(),
                host: host.to_string(),
                message: format!("key authentication failed: {}", e),
            })?;
        if authenticated {
            debug!(user = %user, "Authenticated using key");
            Ok(())
        } else {
            Err(SessionError::Authentication {
                user: user.to_string(),
                host: host.to_string(),
                message: "key rejected by server".to_string(),
            })
        }
    }

    /// Background task sending a no-op exec every keep-alive interval so
    /// NAT/firewall state does not silently expire idle sessions.
    fn spawn_keepalive(
        handle: Arc<RwLock<Option<Handle<ClientHandler>>>>,
        connected: Arc<AtomicBool>,
        identifier: String,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately and doubles as a warmup probe.
            loop {
                interval.tick().await;
                if !connected.load(Ordering::SeqCst) {
                    break;
                }
                let guard = handle.read().await;
                let Some(h) = guard.as_ref() else { break };
                match h.channel_open_session().await {
                    Ok(channel) => {
                        let _ = channel.exec(true, "true").await;
                        let _ = channel.eof().await;
                        trace!(identifier = %identifier, "Sent keepalive");
                    }
                    Err(e) => {
                        warn!(identifier = %identifier, error = %e, "Keepalive failed, session may be dead");
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        })
    }

    /// `user@host:port` identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Shared handle, for tunnel forwarding.
    pub(crate) fn handle_arc(&self) -> Arc<RwLock<Option<Handle<ClientHandler>>>> {
        Arc::clone(&self.handle)
    }

    /// Execute a command, collecting stdout/stderr.
    pub async fn exec(&self, command: &str) -> SessionResult<CommandOutput> {
        self.exec_with(command, |_, _| {}).await
    }

    /// Execute a command, invoking `on_line(line, is_stderr)` for each
    /// complete output line as it arrives, then returning the accumulated
    /// output. The whole invocation is bounded by the session timeout.
    pub async fn exec_with<F>(&self, command: &str, mut on_line: F) -> SessionResult<CommandOutput>
    where
        F: FnMut(&str, bool) + Send,
    {
        trace!(identifier = %self.identifier, command = %command, "Executing remote command");

        let fut = async {
            let guard = self.handle.read().await;
            let handle = guard.as_ref().ok_or(SessionError::Closed)?;
            let mut channel = handle.channel_open_session().await.map_err(|e| {
                SessionError::Channel(format!("failed to open exec channel: {}", e))
            })?;
            drop(guard);

            channel.exec(true, command).await.map_err(|e| {
                SessionError::Channel(format!("failed to start command: {}", e))
            })?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut pending_out = String::new();
            let mut pending_err = String::new();
            let mut exit_code = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        stdout.extend_from_slice(data);
                        push_lines(&mut pending_out, data, false, &mut on_line);
                    }
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        stderr.extend_from_slice(data);
                        push_lines(&mut pending_err, data, true, &mut on_line);
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(exit_status as i32);
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }

            if !pending_out.is_empty() {
                on_line(pending_out.trim_end_matches(['\r', '\n']), false);
            }
            if !pending_err.is_empty() {
                on_line(pending_err.trim_end_matches(['\r', '\n']), true);
            }

            let _ = channel.eof().await;

            trace!(identifier = %self.identifier, exit_code = ?exit_code, "Command completed");
            Ok(CommandOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        };

        match tokio::time::timeout(self.session_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout {
                host: self.host.clone(),
                timeout_ms: self.session_timeout.as_millis() as u64,
            }),
        }
    }

    /// Liveness probe: open a channel, run an inert command, close it.
    ///
    /// Transport libraries do not reliably report half-open connections
    /// without an active round trip, so the cache runs this before reusing a
    /// session. Returns an error instead of panicking or throwing so callers
    /// branch explicitly.
    pub async fn probe(&self) -> SessionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(SessionError::Closed)?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Channel(format!("probe channel failed: {}", e)))?;
        drop(guard);
        channel
            .exec(true, "true")
            .await
            .map_err(|e| SessionError::Channel(format!("probe command failed: {}", e)))?;
        let _ = channel.eof().await;
        Ok(())
    }

    /// Open an SFTP session over this connection.
    pub async fn open_sftp(&self) -> SessionResult<russh_sftp::client::SftpSession> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(SessionError::Closed)?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Channel(format!("failed to open channel: {}", e)))?;
        drop(guard);
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SessionError::Channel(format!("failed to request SFTP subsystem: {}", e)))?;
        russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SessionError::Channel(format!("failed to create SFTP session: {}", e)))
    }

    /// Disconnect, best-effort. Aborts the keep-alive task, tears down the
    /// bastion tunnel when present, and sends an SSH disconnect.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.keepalive.abort();

        {
            let mut guard = self.handle.write().await;
            if let Some(handle) = guard.take() {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
            }
        }

        if let Some(tunnel) = &self.tunnel {
            tunnel.shutdown().await;
        }
        debug!(identifier = %self.identifier, "SSH session disconnected");
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("identifier", &self.identifier)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("tunneled", &self.tunnel.is_some())
            .finish()
    }
}

/// Append raw channel data to a pending buffer, emitting each completed line.
fn push_lines<F: FnMut(&str, bool)>(
    pending: &mut String,
    data: &[u8],
    is_stderr: bool,
    on_line: &mut F,
) {
    pending.push_str(&String::from_utf8_lossy(data));
    while let Some(pos) = pending.find('\n') {
        let line: String = pending.drain(..=pos).collect();
        on_line(line.trim_end_matches(['\r', '\n']), is_stderr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_lines_emits_complete_lines_only() {
        let mut pending = String::new();
        let mut seen = Vec::new();
        push_lines(&mut pending, b"alpha\nbra", false, &mut |l: &str, e| {
            seen.push((l.to_string(), e));
        });
        assert_eq!(seen, vec![("alpha".to_string(), false)]);
        assert_eq!(pending, "bra");

        push_lines(&mut pending, b"vo\r\ncharlie\n", true, &mut |l: &str, e| {
            seen.push((l.to_string(), e));
        });
        assert_eq!(seen[1], ("bravo".to_string(), true));
        assert_eq!(seen[2], ("charlie".to_string(), true));
        assert!(pending.is_empty());
    }
}
