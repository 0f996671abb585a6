//! Test fixtures shared by tsproxy integration tests.
//!
//! - [`TcpEchoBackend`]: loopback TCP server echoing every byte back
//! - [`RecordingObserver`]: observer keeping every lifecycle event in order
//! - [`free_port`] / [`eventually`]: small helpers for socket tests

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tsproxy_events::{ListenerLabels, ProxyObserver};

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ListenerOpened,
    ListenerClosed,
    ConnectionOpened,
    ConnectionClosed,
}

/// Observer recording every event it receives.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(EventKind, ListenerLabels)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, kind: EventKind, labels: &ListenerLabels) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, labels.clone()));
    }

    /// All events so far, oldest first.
    pub fn events(&self) -> Vec<(EventKind, ListenerLabels)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Events of `kind` for listeners exposed on `port`.
    pub fn count_for_port(&self, kind: EventKind, port: u16) -> usize {
        let port = port.to_string();
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, labels)| *k == kind && labels.exposed_as == port)
            .count()
    }

    /// Listener open/close events only.
    pub fn listener_events(&self) -> Vec<(EventKind, ListenerLabels)> {
        self.events()
            .into_iter()
            .filter(|(k, _)| matches!(k, EventKind::ListenerOpened | EventKind::ListenerClosed))
            .collect()
    }
}

impl ProxyObserver for RecordingObserver {
    fn listener_opened(&self, labels: &ListenerLabels) {
        self.record(EventKind::ListenerOpened, labels);
    }

    fn listener_closed(&self, labels: &ListenerLabels) {
        self.record(EventKind::ListenerClosed, labels);
    }

    fn connection_opened(&self, labels: &ListenerLabels) {
        self.record(EventKind::ConnectionOpened, labels);
    }

    fn connection_closed(&self, labels: &ListenerLabels) {
        self.record(EventKind::ConnectionClosed, labels);
    }
}

/// Loopback TCP server echoing everything it reads.
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub disconnects: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    /// Spawn on `127.0.0.1` with an ephemeral port.
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_on("127.0.0.1:0").await
    }

    /// Spawn on a specific address.
    pub async fn spawn_on(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let disconnects = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let disc_clone = Arc::clone(&disconnects);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                let disconnects = Arc::clone(&disc_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                    disconnects.fetch_add(1, Ordering::Relaxed);
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            disconnects,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn disconnect_count(&self) -> u64 {
        self.disconnects.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
