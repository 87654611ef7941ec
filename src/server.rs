//! Relay engine.
//!
//! Accepts front connections, dials the fixed backend for each one and bridges
//! the two legs. Every connection runs in its own task; a failure or panic in
//! one of them never reaches the accept loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};

use crate::bridge::{run_pair, BridgeEnd, PairEnd, PairOutcome, PairPools};
use crate::buffer::BufferPool;
use crate::cli::ServeArgs;
use crate::common::{format_duration, RelayConfig};
use crate::crypto::{CipherKey, MessageCipher, MAX_MESSAGE_SIZE};
use crate::error::{Error, Result};
use crate::transport::{split_leg, Deadlines};

/// Pause after a failed accept before listening again.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of one relayed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    BackendDialed,
    Bridging,
    Closed,
}

/// Source of inbound connections for the accept loop.
pub trait Acceptor: Send {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Acceptor for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Logs a leg as opened and, when dropped, as closed.
///
/// Dropping happens on every exit path of the handler, unwinding included.
struct LegLog {
    leg: &'static str,
    addr: SocketAddr,
}

impl LegLog {
    fn opened(leg: &'static str, addr: SocketAddr) -> Self {
        tracing::info!(leg, %addr, "connection opened");
        Self { leg, addr }
    }
}

impl Drop for LegLog {
    fn drop(&mut self) {
        tracing::info!(leg = self.leg, addr = %self.addr, "connection closed");
    }
}

/// Relays every accepted connection to one fixed backend.
#[derive(Debug)]
pub struct RelayEngine {
    backend: String,
    front_cipher: Option<Arc<MessageCipher>>,
    back_cipher: Option<Arc<MessageCipher>>,
    deadlines: Deadlines,
    /// Buffers for reads from plain legs.
    pool: Arc<BufferPool>,
    /// Buffers for reads from keyed legs, sized for the largest message.
    frame_pool: Arc<BufferPool>,
}

impl RelayEngine {
    /// Builds an engine from a resolved configuration, deriving both leg keys.
    pub fn new(config: &RelayConfig) -> Self {
        let cipher_for = |secret: &Option<String>| {
            secret
                .as_deref()
                .and_then(CipherKey::derive)
                .map(|key| Arc::new(MessageCipher::new(&key)))
        };

        Self {
            backend: config.backend.clone(),
            front_cipher: cipher_for(&config.front_secret),
            back_cipher: cipher_for(&config.back_secret),
            deadlines: config.deadlines,
            pool: BufferPool::new(config.buffer_size, config.max_idle_buffers),
            frame_pool: BufferPool::new(MAX_MESSAGE_SIZE, config.max_idle_buffers),
        }
    }

    /// Buffer pool for reads from plain legs, shared by all connections.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Buffer pool for reads from keyed legs, shared by all connections.
    pub fn frame_pool(&self) -> &Arc<BufferPool> {
        &self.frame_pool
    }

    fn read_pool(&self, keyed: bool) -> Arc<BufferPool> {
        if keyed {
            Arc::clone(&self.frame_pool)
        } else {
            Arc::clone(&self.pool)
        }
    }

    /// Relays one accepted front connection until either leg ends.
    ///
    /// Both sockets are owned here and dropped before this returns, on every
    /// path. A failed dial closes the front socket without ever opening a
    /// backend socket.
    pub async fn handle_connection(
        &self,
        front: TcpStream,
        peer: SocketAddr,
        shutdown_rx: Option<broadcast::Receiver<()>>,
    ) -> Result<PairOutcome> {
        let _front_log = LegLog::opened("front", peer);
        tracing::debug!(%peer, state = ?ConnectionState::Accepted, "connection state");

        let backend = match TcpStream::connect(&self.backend).await {
            Ok(stream) => stream,
            Err(source) => {
                let err = Error::Dial {
                    backend: self.backend.clone(),
                    source,
                };
                tracing::error!(%peer, error = %err, "backend dial failed");
                tracing::debug!(%peer, state = ?ConnectionState::Closed, "connection state");
                return Err(err);
            }
        };

        let backend_addr = backend.peer_addr()?;
        let _back_log = LegLog::opened("back", backend_addr);
        tracing::debug!(%peer, state = ?ConnectionState::BackendDialed, "connection state");

        for (leg, stream) in [("front", &front), ("back", &backend)] {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(%peer, leg, error = %e, "failed to set TCP_NODELAY");
            }
        }

        let (front_read, front_write) = front.into_split();
        let (back_read, back_write) = backend.into_split();
        let front_leg = split_leg(
            front_read,
            front_write,
            self.front_cipher.as_ref(),
            self.deadlines,
        );
        let back_leg = split_leg(
            back_read,
            back_write,
            self.back_cipher.as_ref(),
            self.deadlines,
        );
        let pools = PairPools {
            front: self.read_pool(front_leg.0.is_keyed()),
            back: self.read_pool(back_leg.0.is_keyed()),
        };

        tracing::debug!(
            %peer,
            state = ?ConnectionState::Bridging,
            front_keyed = front_leg.0.is_keyed(),
            back_keyed = back_leg.0.is_keyed(),
            "bridging legs"
        );

        let outcome = run_pair(front_leg, back_leg, &pools, shutdown_rx).await;

        let reason = match &outcome.end {
            PairEnd::Finished(o) => match o.end {
                BridgeEnd::Eof => format!("{} eof", o.direction),
                BridgeEnd::ReadFailed(ref e) if e.is_timeout() => {
                    format!("{} read deadline", o.direction)
                }
                BridgeEnd::ReadFailed(_) => format!("{} read failed", o.direction),
                BridgeEnd::WriteFailed(_) => format!("{} write failed", o.direction),
            },
            PairEnd::Fault { direction, .. } => format!("{} fault", direction),
            PairEnd::Shutdown => "shutdown".to_string(),
        };
        tracing::info!(
            %peer,
            backend = %backend_addr,
            front_to_back = outcome.front_to_back,
            back_to_front = outcome.back_to_front,
            reason = %reason,
            "relay finished"
        );
        tracing::debug!(%peer, state = ?ConnectionState::Closed, "connection state");

        Ok(outcome)
    }

    /// Runs the accept loop until `shutdown` resolves.
    ///
    /// Accept failures are logged and the loop keeps listening. On shutdown,
    /// live connections are told to close and the loop waits for their
    /// handlers before returning.
    pub async fn serve<A, S>(self: Arc<Self>, mut acceptor: A, shutdown: S)
    where
        A: Acceptor,
        S: Future<Output = ()>,
    {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!(active = connections.len(), "stopping accept loop");
                    break;
                }
                accepted = acceptor.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let engine = Arc::clone(&self);
                            let conn_shutdown_rx = shutdown_tx.subscribe();
                            connections.spawn(async move {
                                let _ = engine
                                    .handle_connection(stream, peer, Some(conn_shutdown_rx))
                                    .await;
                            });
                        }
                        Err(e) => {
                            let err = Error::Accept(e);
                            tracing::error!(error = %err, "accept failed, continuing");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    report_handler_exit(joined);
                }
            }
        }

        let _ = shutdown_tx.send(());
        while let Some(joined) = connections.join_next().await {
            report_handler_exit(joined);
        }
    }
}

fn report_handler_exit(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "connection handler panicked");
        } else {
            tracing::warn!(error = %e, "connection handler cancelled");
        }
    }
}

/// Runs the relay described by the serve arguments until SIGINT.
pub async fn run_server(args: &ServeArgs) -> Result<()> {
    let config = RelayConfig::from_args(args)?;

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|source| Error::Listen {
            addr: config.listen.to_string(),
            source,
        })?;

    print_startup_message(&config);
    tracing::info!("Relay listening on {}", listener.local_addr()?);

    let engine = Arc::new(RelayEngine::new(&config));
    engine
        .serve(listener, async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Received SIGINT, initiating graceful shutdown..."),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to listen for SIGINT");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

    tracing::info!("Relay shutdown complete");

    Ok(())
}

/// Prints the startup message.
fn print_startup_message(config: &RelayConfig) {
    let leg_mode = |secret: &Option<String>| if secret.is_some() { "keyed" } else { "plain" };

    eprintln!("Starting relay...");
    eprintln!("  Listen: {}", config.listen);
    eprintln!("  Backend: {}", config.backend);
    eprintln!("  Front Leg: {}", leg_mode(&config.front_secret));
    eprintln!("  Back Leg: {}", leg_mode(&config.back_secret));
    eprintln!("  Read Timeout: {}", format_duration(config.deadlines.read));
    eprintln!("  Write Timeout: {}", format_duration(config.deadlines.write));
    eprintln!("  Buffer Size: {}", config.buffer_size);
}
