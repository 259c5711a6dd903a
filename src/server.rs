//! TCP acceptor for echo sessions.
//!
//! Owns the listening socket, gates every `accept` through the admission
//! gate, and spawns one independent session task per admitted connection.

use crate::admission::{AdmissionGate, Reservation};
use crate::config::Config;
use crate::counter::SessionCounter;
use crate::session::{ClientSession, SessionHandler};
use crate::shutdown::Shutdown;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Pause after a transient accept failure before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Where the acceptor takes its connections from.
pub trait ConnectionSource: Send + Sync {
    /// Wait for the next incoming connection.
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl ConnectionSource for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Server instance
pub struct Server<L = TcpListener> {
    config: Config,
    listener: L,
    local_addr: SocketAddr,
    counter: Arc<SessionCounter>,
    gate: AdmissionGate,
    handler: Arc<SessionHandler>,
    next_session_id: u64,
}

impl Server {
    /// Bind the listening socket on `0.0.0.0:port`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: Config, counter: Arc<SessionCounter>) -> Result<Self, ServerError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let listener = create_listener(addr, config.backlog)?;
        let listener =
            TcpListener::from_std(listener).map_err(|e| ServerError::Listen(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Listen(addr, e))?;

        let gate = AdmissionGate::new(
            config.admission,
            Arc::clone(&counter),
            config.admission_backoff,
        );
        let handler = Arc::new(SessionHandler::new(&config));

        Ok(Server {
            config,
            listener,
            local_addr,
            counter,
            gate,
            handler,
            next_session_id: 0,
        })
    }
}

impl<L: ConnectionSource> Server<L> {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared session counter.
    pub fn counter(&self) -> &Arc<SessionCounter> {
        &self.counter
    }

    /// Accept connections until shutdown or a fatal accept error.
    ///
    /// The listening socket is closed when this returns.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<(), ServerError> {
        info!(
            address = %self.local_addr,
            max_clients = self.counter.max_clients(),
            admission = ?self.gate.mode(),
            buffer_size = self.config.receive_buffer_size,
            "Server listening"
        );

        let mut stop = shutdown.subscribe();
        // Cleared once every shutdown sender is gone.
        let mut listening = true;

        loop {
            let accepted = tokio::select! {
                signal = stop.recv(), if listening => match signal {
                    Err(broadcast::error::RecvError::Closed) => {
                        listening = false;
                        continue;
                    }
                    _ => {
                        info!(
                            active = self.counter.snapshot(),
                            listeners = shutdown.receiver_count(),
                            "Shutdown requested, closing listener"
                        );
                        return Ok(());
                    }
                },
                accepted = self.accept_one() => accepted,
            };

            match accepted {
                Ok((stream, peer, reservation)) => {
                    self.dispatch(stream, peer, reservation, &shutdown);
                }
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
                Err(e) => {
                    error!(error = %e, "Unable to accept connection, closing listener");
                    return Err(ServerError::Accept(e));
                }
            }
        }
    }

    /// Wait for admission, then accept one connection.
    async fn accept_one(&self) -> io::Result<(TcpStream, SocketAddr, Reservation)> {
        let reservation = self.gate.reserve().await;
        debug!("Waiting for new connection");
        let (stream, peer) = self.listener.accept().await?;
        Ok((stream, peer, reservation))
    }

    /// Replace the connection source, keeping everything else.
    #[cfg(test)]
    fn map_listener<M>(self, f: impl FnOnce(L) -> M) -> Server<M> {
        Server {
            config: self.config,
            listener: f(self.listener),
            local_addr: self.local_addr,
            counter: self.counter,
            gate: self.gate,
            handler: self.handler,
            next_session_id: self.next_session_id,
        }
    }

    /// Count the connection as active and hand it to its own task.
    fn dispatch(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        reservation: Reservation,
        shutdown: &Shutdown,
    ) {
        self.next_session_id += 1;
        let id = self.next_session_id;

        let (slot, active) = reservation.admit();
        info!(
            session = id,
            peer = %peer,
            active,
            max_clients = self.counter.max_clients(),
            "Client accepted"
        );

        let session = ClientSession { stream, peer, id };
        let handler = Arc::clone(&self.handler);
        let signal = shutdown.subscribe();

        tokio::spawn(async move {
            handler.run(session, slot, signal).await;
        });
    }
}

/// Create a non-blocking listener with address reuse enabled.
fn create_listener(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener, ServerError> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )
    .map_err(|e| ServerError::Bind(addr, e))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| ServerError::Bind(addr, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ServerError::Bind(addr, e))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Bind(addr, e))?;

    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket
        .listen(backlog)
        .map_err(|e| ServerError::Listen(addr, e))?;

    Ok(socket.into())
}

/// Accept errors the loop can recover from.
///
/// Aborted handshakes and descriptor or buffer exhaustion clear up on their
/// own; anything else means the listening socket is no longer usable.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

/// Acceptor errors
#[derive(Debug)]
pub enum ServerError {
    /// Socket creation or bind failed.
    Bind(SocketAddr, io::Error),
    /// Transition to the listening state failed.
    Listen(SocketAddr, io::Error),
    /// The listening socket stopped accepting connections.
    Accept(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
            ServerError::Listen(addr, e) => write!(f, "Failed to listen on {addr}: {e}"),
            ServerError::Accept(e) => write!(f, "Failed to accept connection: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e) | ServerError::Listen(_, e) | ServerError::Accept(e) => Some(e),
        }
    }
}
