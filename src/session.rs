//! Per-connection echo sessions.
//!
//! Each admitted connection is owned by exactly one [`SessionHandler::run`]
//! task. The task echoes every receive event back to the peer unchanged and
//! ends on peer close, I/O error, idle timeout or server shutdown. Its
//! [`SessionSlot`] is dropped on every exit path, which releases the
//! session's place in the counter.

use crate::config::{Config, KeepaliveConfig};
use crate::counter::SessionSlot;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// An accepted and admitted client connection.
#[derive(Debug)]
pub struct ClientSession {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub id: u64,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed its side of the connection.
    PeerClosed,
    /// Nothing was received within the idle timeout.
    Idle,
    /// The server is shutting down.
    Shutdown,
    /// Receiving from the peer failed.
    ReceiveError,
    /// Echoing back to the peer failed.
    SendError,
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SessionEnd::PeerClosed => "peer closed",
            SessionEnd::Idle => "idle timeout",
            SessionEnd::Shutdown => "shutdown",
            SessionEnd::ReceiveError => "receive error",
            SessionEnd::SendError => "send error",
        };
        f.write_str(reason)
    }
}

/// Settings shared by every session task.
#[derive(Debug, Clone)]
pub struct SessionHandler {
    receive_buffer_size: usize,
    keepalive: KeepaliveConfig,
    idle_timeout: Option<Duration>,
}

impl SessionHandler {
    pub fn new(config: &Config) -> Self {
        Self {
            receive_buffer_size: config.receive_buffer_size,
            keepalive: config.keepalive.clone(),
            idle_timeout: config.idle_timeout,
        }
    }

    /// Run one session to completion.
    pub async fn run(
        &self,
        session: ClientSession,
        slot: SessionSlot,
        mut shutdown: broadcast::Receiver<()>,
    ) -> SessionEnd {
        let ClientSession {
            mut stream,
            peer,
            id,
        } = session;

        if let Err(e) = apply_keepalive(&stream, &self.keepalive) {
            warn!(session = id, error = %e, "Failed to set keepalive");
        }

        let mut buffer = vec![0u8; self.receive_buffer_size];
        let end = echo_loop(&mut stream, &mut buffer, self.idle_timeout, &mut shutdown, id).await;

        if let Err(e) = stream.shutdown().await {
            debug!(session = id, error = %e, "Socket shutdown failed");
        }
        drop(stream);
        drop(slot);

        info!(session = id, peer = %peer, reason = %end, "Session closed");
        end
    }
}

/// Enable TCP keepalive with the configured idle time, interval and count.
fn apply_keepalive(stream: &TcpStream, keepalive: &KeepaliveConfig) -> io::Result<()> {
    let params = TcpKeepalive::new().with_time(keepalive.idle());

    #[cfg(any(
        target_os = "android",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "macos"
    ))]
    let params = params
        .with_interval(keepalive.interval())
        .with_retries(keepalive.count);

    SockRef::from(stream).set_tcp_keepalive(&params)
}

/// Echo each receive event back to the peer until the session ends.
///
/// At most `buffer.len()` bytes are taken per receive. Every chunk is
/// written back in full before the next receive. Shutdown is observed while
/// waiting on either side, so a peer that stops reading cannot hold the
/// session open.
pub async fn echo_loop<S>(
    stream: &mut S,
    buffer: &mut [u8],
    idle_timeout: Option<Duration>,
    shutdown: &mut broadcast::Receiver<()>,
    id: u64,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Cleared once every shutdown sender is gone.
    let mut listening = true;

    loop {
        let received = tokio::select! {
            signal = shutdown.recv(), if listening => match signal {
                Err(broadcast::error::RecvError::Closed) => {
                    listening = false;
                    continue;
                }
                _ => return SessionEnd::Shutdown,
            },
            result = receive(stream, buffer, idle_timeout) => result,
        };

        let n = match received {
            None => {
                debug!(session = id, "Session idle, closing");
                return SessionEnd::Idle;
            }
            Some(Ok(0)) => {
                debug!(session = id, "Connection closed by peer");
                return SessionEnd::PeerClosed;
            }
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                warn!(session = id, error = %e, "Receive failed");
                return SessionEnd::ReceiveError;
            }
        };

        trace!(
            session = id,
            bytes = n,
            data = %String::from_utf8_lossy(&buffer[..n]),
            "Received"
        );

        let write = stream.write_all(&buffer[..n]);
        tokio::pin!(write);
        let sent = loop {
            tokio::select! {
                signal = shutdown.recv(), if listening => match signal {
                    Err(broadcast::error::RecvError::Closed) => listening = false,
                    _ => return SessionEnd::Shutdown,
                },
                result = &mut write => break result,
            }
        };

        if let Err(e) = sent {
            warn!(session = id, error = %e, "Send failed");
            return SessionEnd::SendError;
        }
    }
}

/// One receive. `None` means the idle timeout elapsed first.
async fn receive<S>(
    stream: &mut S,
    buffer: &mut [u8],
    idle_timeout: Option<Duration>,
) -> Option<io::Result<usize>>
where
    S: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, stream.read(buffer)).await.ok(),
        None => Some(stream.read(buffer).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::SessionCounter;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    fn no_shutdown() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
        broadcast::channel(1)
    }

    #[tokio::test]
    async fn test_echo_until_peer_closes() {
        let mut stream = Builder::new()
            .read(b"ping")
            .write(b"ping")
            .read(b"hello world")
            .write(b"hello world")
            .build();
        let mut buffer = vec![0u8; 128];
        let (_tx, mut rx) = no_shutdown();

        let end = echo_loop(&mut stream, &mut buffer, None, &mut rx, 1).await;
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_echo_is_bounded_by_buffer() {
        let mut stream = Builder::new()
            .read(b"abcdefgh")
            .write(b"abcd")
            .write(b"efgh")
            .build();
        let mut buffer = vec![0u8; 4];
        let (_tx, mut rx) = no_shutdown();

        let end = echo_loop(&mut stream, &mut buffer, None, &mut rx, 1).await;
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_echo_preserves_binary_bytes() {
        let payload = [0u8, 255, 13, 10, 7, 0];
        let mut stream = Builder::new().read(&payload).write(&payload).build();
        let mut buffer = vec![0u8; 128];
        let (_tx, mut rx) = no_shutdown();

        let end = echo_loop(&mut stream, &mut buffer, None, &mut rx, 1).await;
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_receive_error_ends_session() {
        let mut stream = Builder::new()
            .read(b"x")
            .write(b"x")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut buffer = vec![0u8; 128];
        let (_tx, mut rx) = no_shutdown();

        let end = echo_loop(&mut stream, &mut buffer, None, &mut rx, 1).await;
        assert_eq!(end, SessionEnd::ReceiveError);
    }

    #[tokio::test]
    async fn test_send_error_ends_session() {
        let mut stream = Builder::new()
            .read(b"x")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
            .build();
        let mut buffer = vec![0u8; 128];
        let (_tx, mut rx) = no_shutdown();

        let end = echo_loop(&mut stream, &mut buffer, None, &mut rx, 1).await;
        assert_eq!(end, SessionEnd::SendError);
    }

    #[tokio::test]
    async fn test_dropped_shutdown_sender_is_ignored() {
        let mut stream = Builder::new()
            .read(b"still here")
            .write(b"still here")
            .build();
        let mut buffer = vec![0u8; 128];
        let (tx, mut rx) = no_shutdown();
        drop(tx);

        let end = echo_loop(&mut stream, &mut buffer, None, &mut rx, 1).await;
        assert_eq!(end, SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_shutdown_signal_ends_session() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut buffer = vec![0u8; 128];
        let (tx, mut rx) = no_shutdown();

        let task = tokio::spawn(async move {
            echo_loop(&mut server, &mut buffer, None, &mut rx, 1).await
        });
        tx.send(()).unwrap();

        assert_eq!(task.await.unwrap(), SessionEnd::Shutdown);
        drop(client);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_echo() {
        // The client never reads, so the echo back fills the pipe and stalls.
        let (mut client, mut server) = tokio::io::duplex(8);
        let mut buffer = vec![0u8; 128];
        let (tx, mut rx) = no_shutdown();

        let mut task = tokio::spawn(async move {
            echo_loop(&mut server, &mut buffer, None, &mut rx, 1).await
        });
        client.write_all(b"abcdefgh").await.unwrap();
        client.write_all(b"ijklmnop").await.unwrap();

        let stalled = tokio::time::timeout(Duration::from_millis(100), &mut task).await;
        assert!(stalled.is_err());

        tx.send(()).unwrap();
        let end = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("blocked echo ignored shutdown")
            .unwrap();
        assert_eq!(end, SessionEnd::Shutdown);
        drop(client);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_session() {
        let (_client, mut server) = tokio::io::duplex(64);
        let mut buffer = vec![0u8; 128];
        let (_tx, mut rx) = no_shutdown();

        let end = echo_loop(
            &mut server,
            &mut buffer,
            Some(Duration::from_millis(50)),
            &mut rx,
            1,
        )
        .await;
        assert_eq!(end, SessionEnd::Idle);
    }

    #[tokio::test]
    async fn test_run_releases_slot_and_sets_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let mut config = Config::default();
        config.keepalive.idle_secs = 7;
        let handler = SessionHandler::new(&config);

        #[cfg(target_os = "linux")]
        {
            apply_keepalive(&stream, &config.keepalive).unwrap();
            let sock = SockRef::from(&stream);
            assert!(sock.keepalive().unwrap());
            assert_eq!(sock.keepalive_time().unwrap(), Duration::from_secs(7));
        }

        let counter = SessionCounter::new(1);
        let (slot, _) = SessionSlot::acquire(Arc::clone(&counter), None);
        let session = ClientSession {
            stream,
            peer,
            id: 1,
        };
        let (_tx, rx) = no_shutdown();
        let task = tokio::spawn(async move { handler.run(session, slot, rx).await });

        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
        assert_eq!(counter.snapshot(), 1);

        drop(client);
        assert_eq!(task.await.unwrap(), SessionEnd::PeerClosed);
        assert_eq!(counter.snapshot(), 0);
    }
}
