//! One relayed client connection.
//!
//! A connection owns an accepted client socket and the backend socket dialed
//! for it, and copies bytes both ways on two tasks. Whichever direction ends
//! first tears the pair down; the other direction stops on the shared
//! shutdown signal and both sockets are dropped with it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn, Instrument};

use super::listener::Listener;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Direction of one relay task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToBackend,
    FromBackend,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::ToBackend => "client->backend",
            Self::FromBackend => "backend->client",
        }
    }
}

/// How a relay task ended.
#[derive(Debug)]
enum RelayEnd {
    /// Source reached end of stream.
    Eof,
    /// The other direction finished first.
    Stopped,
    /// Read or write failed.
    Failed(io::Error),
}

/// An accepted client socket paired with its backend socket.
pub(crate) struct Connection {
    id: u64,
    peer_worker: u64,
    peer_addr: SocketAddr,
    inbound: TcpStream,
    outbound: TcpStream,
}

impl Connection {
    /// `id` correlates both directions; `peer_worker` tags the backend->client task.
    pub fn new(
        id: u64,
        peer_worker: u64,
        peer_addr: SocketAddr,
        inbound: TcpStream,
        outbound: TcpStream,
    ) -> Self {
        Self {
            id,
            peer_worker,
            peer_addr,
            inbound,
            outbound,
        }
    }

    /// Register with `listener` and start relaying in both directions.
    pub fn run(self, listener: Arc<Listener>) {
        listener.add_connection(self.id, self.peer_addr);

        debug!(
            key = %listener.key(),
            connection = self.id,
            peer_addr = %self.peer_addr,
            "Connection opened"
        );

        let (shutdown, _) = watch::channel(false);
        let teardown = Arc::new(Teardown {
            closed: AtomicBool::new(false),
            shutdown,
            listener,
            id: self.id,
        });

        let (inbound_read, inbound_write) = self.inbound.into_split();
        let (outbound_read, outbound_write) = self.outbound.into_split();

        // Subscribe before spawning so an early finish still wakes the other direction.
        let to_backend_stop = teardown.shutdown.subscribe();
        let from_backend_stop = teardown.shutdown.subscribe();

        let span = tracing::debug_span!("relay", connection = self.id, worker = self.id);
        tokio::spawn(
            relay(
                Direction::ToBackend,
                inbound_read,
                outbound_write,
                to_backend_stop,
                Arc::clone(&teardown),
            )
            .instrument(span),
        );

        let span = tracing::debug_span!("relay", connection = self.id, worker = self.peer_worker);
        tokio::spawn(
            relay(
                Direction::FromBackend,
                outbound_read,
                inbound_write,
                from_backend_stop,
                teardown,
            )
            .instrument(span),
        );
    }
}

/// Teardown state shared by both relay tasks of one connection.
struct Teardown {
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    listener: Arc<Listener>,
    id: u64,
}

impl Teardown {
    /// Stop the other direction and unregister the connection.
    ///
    /// Only the first caller does anything.
    fn finish(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let _ = self.shutdown.send(true);
        self.listener.remove_connection(self.id);
    }
}

async fn relay<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    mut shutdown: watch::Receiver<bool>,
    teardown: Arc<Teardown>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    let end = loop {
        let step = async {
            let n = reader.read(&mut buf).await?;
            if n > 0 {
                writer.write_all(&buf[..n]).await?;
            }
            Ok::<usize, io::Error>(n)
        };

        tokio::select! {
            biased;
            _ = shutdown.changed() => break RelayEnd::Stopped,
            result = step => match result {
                Ok(0) => break RelayEnd::Eof,
                Ok(n) => total += n as u64,
                Err(e) => break RelayEnd::Failed(e),
            },
        }
    };

    if matches!(end, RelayEnd::Eof) {
        let _ = writer.shutdown().await;
    }

    match &end {
        RelayEnd::Failed(e) if !is_peer_closed(e) => {
            warn!(direction = direction.as_str(), bytes = total, error = %e, "Relay failed");
        }
        RelayEnd::Failed(e) => {
            debug!(direction = direction.as_str(), bytes = total, error = %e, "Relay closed by peer");
        }
        RelayEnd::Eof | RelayEnd::Stopped => {
            debug!(direction = direction.as_str(), bytes = total, outcome = ?end, "Relay finished");
        }
    }

    match direction {
        Direction::ToBackend => teardown.listener.record_relayed(total, 0),
        Direction::FromBackend => teardown.listener.record_relayed(0, total),
    }

    teardown.finish();
}

/// Errors that mean the other end went away rather than a real fault.
fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
