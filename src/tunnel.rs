//! SSH tunnel to a deployed instance.
//!
//! The tunnel authenticates one `russh` session with the instance's key
//! pair, binds a local listener on a kernel-assigned port and relays every
//! accepted connection over a dedicated `direct-tcpip` channel to the
//! instance dashboard. The relay loop is written against [`ForwardTarget`]
//! rather than the SSH session directly so it can be exercised with a plain
//! TCP target.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use russh::client::{self, Handle};
use russh::keys::ssh_key::{PrivateKey, PublicKey};
use russh::keys::PrivateKeyWithHashAlg;
use russh::Disconnect;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// SSH port on the instance.
const SSH_PORT: u16 = 22;
/// User the instance image authorises the injected key for.
const SSH_USER: &str = "root";
/// Host of the forwarded service, as seen from the instance.
const REMOTE_HOST: &str = "localhost";
/// Port of the instance dashboard.
const REMOTE_PORT: u16 = 8080;

/// Errors raised while establishing or operating a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Raised when the TCP or SSH handshake with the instance fails.
    #[error("ssh connection to {address} failed: {source}")]
    Connect {
        /// Address that was dialled.
        address: String,
        /// The underlying SSH failure.
        #[source]
        source: russh::Error,
    },
    /// Raised when the instance rejects the key pair.
    #[error("publickey authentication rejected for user '{user}'")]
    AuthenticationRejected {
        /// The SSH user that failed to authenticate.
        user: String,
    },
    /// Raised when the local listener cannot be bound.
    #[error("failed to bind local listener: {0}")]
    Bind(#[source] io::Error),
    /// Raised by other SSH protocol failures.
    #[error(transparent)]
    Ssh(#[from] russh::Error),
}

/// Byte stream a tunnel connection is relayed over.
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

/// Opens streams to the fixed remote endpoint of a tunnel.
pub trait ForwardTarget: Send + Sync + 'static {
    /// Opens one stream to the remote endpoint for one local connection.
    fn open(
        &self,
    ) -> Pin<Box<dyn Future<Output = io::Result<Box<dyn RelayStream>>> + Send + '_>>;
}

struct SshTarget {
    session: Arc<Handle<ClientHandler>>,
}

impl ForwardTarget for SshTarget {
    fn open(
        &self,
    ) -> Pin<Box<dyn Future<Output = io::Result<Box<dyn RelayStream>>> + Send + '_>> {
        Box::pin(async move {
            let channel = self
                .session
                .channel_open_direct_tcpip(REMOTE_HOST, u32::from(REMOTE_PORT), "127.0.0.1", 0)
                .await
                .map_err(io::Error::other)?;
            Ok(Box::new(channel.into_stream()) as Box<dyn RelayStream>)
        })
    }
}

struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Instances are created with fresh host keys; there is nothing to pin
    // them against, so any presented key is accepted.
    async fn check_server_key(&mut self, _server_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// A running tunnel.
///
/// Dropping the value without calling [`Tunnel::close`] leaves the accept
/// task running until the runtime shuts down, so callers should close
/// explicitly.
pub struct Tunnel {
    local_port: u16,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
    session: Option<Arc<Handle<ClientHandler>>>,
}

impl Tunnel {
    /// Connects to the instance and starts forwarding.
    ///
    /// Returns only once the local listener is bound; the chosen port is
    /// available from [`Tunnel::local_port`] immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Connect`] when the instance is unreachable,
    /// [`TunnelError::AuthenticationRejected`] when the key is refused and
    /// [`TunnelError::Bind`] when no local port can be bound.
    pub async fn start(host: &str, credential: Arc<PrivateKey>) -> Result<Self, TunnelError> {
        let address = format!("{host}:{SSH_PORT}");
        let config = Arc::new(client::Config::default());
        let mut session = client::connect(config, (host, SSH_PORT), ClientHandler)
            .await
            .map_err(|source| TunnelError::Connect {
                address: address.clone(),
                source,
            })?;

        let auth = session
            .authenticate_publickey(
                SSH_USER,
                PrivateKeyWithHashAlg::new(credential, None),
            )
            .await?;
        if !matches!(auth, client::AuthResult::Success) {
            return Err(TunnelError::AuthenticationRejected {
                user: SSH_USER.to_owned(),
            });
        }

        let shared_session = Arc::new(session);
        let target = Arc::new(SshTarget {
            session: Arc::clone(&shared_session),
        });
        let mut tunnel = Self::start_with_target(target).await?;
        tunnel.session = Some(shared_session);
        Ok(tunnel)
    }

    /// Starts the relay loop against an arbitrary target, without an SSH
    /// session. This is the entry point tests use.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Bind`] when no local port can be bound.
    pub async fn start_with_target(
        target: Arc<dyn ForwardTarget>,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(TunnelError::Bind)?;
        let local_port = listener.local_addr().map_err(TunnelError::Bind)?.port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(serve(listener, target, shutdown_rx));

        Ok(Self {
            local_port,
            shutdown: Some(shutdown_tx),
            accept_task: Some(accept_task),
            session: None,
        })
    }

    /// Returns the local port the tunnel listens on.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stops accepting connections, tears down active relays and
    /// disconnects the session.
    ///
    /// Closing an already closed tunnel is a no-op.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(true).ok();
        }
        if let Some(task) = self.accept_task.take() {
            task.await.ok();
        }
        if let Some(session) = self.session.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "english")
                .await
                .ok();
        }
    }
}

async fn serve(
    listener: TcpListener,
    target: Arc<dyn ForwardTarget>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut relays = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((local, peer)) => {
                    debug!(%peer, "tunnel connection accepted");
                    relays.spawn(relay(local, Arc::clone(&target)));
                }
                Err(err) => {
                    warn!(error = %err, "tunnel accept failed");
                    break;
                }
            },
        }
    }
    // Established connections go down with the accept loop.
    relays.shutdown().await;
}

async fn relay(mut local: TcpStream, target: Arc<dyn ForwardTarget>) {
    let mut remote = match target.open().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "failed to open forwarding channel");
            return;
        }
    };
    if let Err(err) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        debug!(error = %err, "tunnel connection closed with error");
    }
}
