//! Bastion-host tunneling.
//!
//! When a target is only reachable through an intermediary, the session
//! factory first opens a session to the bastion with the bastion's own
//! credentials, binds a local TCP listener, and forwards every accepted
//! connection through a direct-tcpip channel to the real target. The inner
//! session is then opened against `127.0.0.1:<forwarded-port>` with the
//! target's credentials. Only the inner session is returned and cached; the
//! bastion session lives inside the returned tunnel and is torn down with it.

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::config::SshSessionConfig;
use super::russh::{InteractivePasswordPrompt, SshSession};
use super::{SessionError, SessionResult};

/// A live port-forwarding tunnel through a bastion host.
///
/// Dropping the tunnel stops accepting new connections; in-flight forwards
/// finish on their own.
pub struct BastionTunnel {
    /// The bastion session kept alive for the tunnel's lifetime.
    bastion: Box<SshSession>,
    /// The accept loop.
    forwarder: JoinHandle<()>,
    /// Local endpoint the inner session connects to.
    local_addr: SocketAddr,
}

impl BastionTunnel {
    /// Local endpoint the inner session connects to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the forwarder and disconnect the bastion session.
    pub(crate) async fn shutdown(&self) {
        self.forwarder.abort();
        Box::pin(self.bastion.disconnect()).await;
    }
}

impl std::fmt::Debug for BastionTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BastionTunnel")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Open a session to the configured target through its bastion.
pub(crate) async fn open_through_bastion(
    config: &SshSessionConfig,
    prompt: Option<InteractivePasswordPrompt>,
) -> SessionResult<SshSession> {
    let bastion_config = config.bastion.as_deref().ok_or_else(|| {
        SessionError::InvalidConfig(
            "bastion auth scheme resolved without a bastion sub-config".to_string(),
        )
    })?;

    debug!(
        bastion = %bastion_config.identifier(),
        target = %format!("{}:{}", config.host, config.port),
        "Opening bastion tunnel"
    );

    // The bastion sub-config is an independent session configuration and may
    // itself be tunneled; recursion is bounded by the configuration depth.
    let bastion =
        Box::pin(SshSession::open_with_prompt(bastion_config, prompt.clone())).await?;

    let (local_addr, forwarder) = start_forward(&bastion, &config.host, config.port).await?;
    let tunnel = BastionTunnel {
        bastion: Box::new(bastion),
        forwarder,
        local_addr,
    };

    debug!(local = %local_addr, "Bastion tunnel listening");
    SshSession::open_direct(
        config,
        "127.0.0.1",
        local_addr.port(),
        Some(tunnel),
        prompt,
    )
    .await
}

/// Bind a loopback listener and forward each accepted connection through a
/// direct-tcpip channel on the bastion session.
async fn start_forward(
    bastion: &SshSession,
    target_host: &str,
    target_port: u16,
) -> SessionResult<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let local_addr = listener.local_addr()?;

    let handle = bastion.handle_arc();
    let target_host = target_host.to_string();
    let forwarder = tokio::spawn(async move {
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Bastion forwarder accept failed");
                    break;
                }
            };

            let channel = {
                let guard = handle.read().await;
                let Some(h) = guard.as_ref() else {
                    warn!("Bastion session closed; stopping forwarder");
                    break;
                };
                match h
                    .channel_open_direct_tcpip(
                        target_host.clone(),
                        u32::from(target_port),
                        "127.0.0.1",
                        u32::from(peer.port()),
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        warn!(error = %e, target = %target_host, "direct-tcpip channel failed");
                        continue;
                    }
                }
            };

            tokio::spawn(async move {
                let mut remote = channel.into_stream();
                match tokio::io::copy_bidirectional(&mut stream, &mut remote).await {
                    Ok((sent, received)) => {
                        trace!(sent, received, "Forwarded connection closed");
                    }
                    Err(e) => trace!(error = %e, "Forwarded connection errored"),
                }
            });
        }
    });

    Ok((local_addr, forwarder))
}
