//! TCP listener for one exposed port.
//!
//! A listener binds its port, registers it in the global port table and
//! runs an accept loop on its own task. Every accepted socket is paired with
//! a freshly dialed backend socket and handed to a [`Connection`].
//!
//! Lifecycle: `Bound -> Accepting -> Closed`, never backwards. A listener
//! whose bind fails is discarded before it exists, so there is no state for
//! it. Closing a listener stops the accept loop and frees the port;
//! connections that are already relaying keep going until their own sockets
//! end.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use tsproxy_events::ListenerLabels;

use super::backend::{self, DEFAULT_DIAL_TIMEOUT};
use super::connection::Connection;
use super::context::ProxyContext;
use super::error::ListenerError;
use super::mapping::{ListenerKey, OwnerKey};
use super::ports::PortSlot;

/// Pause after a failed accept so a persistent error cannot spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Runtime settings shared by all listeners.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Host address exposed ports bind on.
    pub bind_host: IpAddr,
    /// Backend connect timeout.
    pub dial_timeout: Duration,
    /// TCP keep-alive idle time for accepted and dialed sockets (off if `None`).
    pub keepalive: Option<Duration>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keepalive: None,
        }
    }
}

/// Listener lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    /// Socket bound, accept loop not yet running.
    Bound,
    /// Accept loop running.
    Accepting,
    /// Socket closed.
    Closed,
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections whose relay has finished.
    pub connections_closed: AtomicU64,
    /// Accepted sockets dropped because the backend dial failed.
    pub backend_failed: AtomicU64,
    /// Bytes relayed client to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend to client.
    pub bytes_from_backend: AtomicU64,
}

/// Bookkeeping for one active connection.
#[derive(Debug, Clone, Copy)]
struct ActiveConnection {
    peer_addr: SocketAddr,
    opened_at: Instant,
}

/// A TCP listener forwarding one exposed port to one backend.
pub struct Listener {
    /// Worker id of the accept loop; also identifies this instance in the port table.
    id: u64,
    owner: OwnerKey,
    key: ListenerKey,
    labels: ListenerLabels,
    backend_addr: String,
    local_addr: SocketAddr,
    ctx: Arc<ProxyContext>,
    state: Mutex<ListenerState>,
    connections: Mutex<HashMap<u64, ActiveConnection>>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stats: ListenerStats,
}

impl Listener {
    /// Bind the exposed port and start accepting.
    ///
    /// On bind failure nothing is registered and the listener is discarded.
    pub(crate) async fn start(
        owner: OwnerKey,
        key: ListenerKey,
        ctx: Arc<ProxyContext>,
    ) -> Result<Arc<Self>, ListenerError> {
        let bind_addr = SocketAddr::new(ctx.config.bind_host, key.expose_port);

        info!(
            key = %key,
            owner = %owner,
            port = key.expose_port,
            "Starting listener"
        );

        let socket = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: bind_addr,
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| ListenerError::Bind {
            addr: bind_addr,
            source,
        })?;

        let id = ctx.workers.next();
        let backend_addr = ctx.resolver.backend_address(&key);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let listener = Arc::new(Self {
            id,
            labels: key.labels(),
            owner,
            key,
            backend_addr,
            local_addr,
            ctx,
            state: Mutex::new(ListenerState::Bound),
            connections: Mutex::new(HashMap::new()),
            shutdown,
            accept_task: Mutex::new(None),
            stats: ListenerStats::default(),
        });

        listener.ctx.ports.register(PortSlot {
            owner: listener.owner.clone(),
            key: listener.key.clone(),
            listener_id: id,
        });

        let span = tracing::info_span!("listener", key = %listener.key, worker = id);
        let task = tokio::spawn(
            Arc::clone(&listener)
                .accept_loop(socket, shutdown_rx)
                .instrument(span),
        );
        *listener
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        listener.set_state(ListenerState::Accepting);

        listener.ctx.observer.listener_opened(&listener.labels);

        info!(
            key = %listener.key,
            bind_addr = %local_addr,
            backend_addr = %listener.backend_addr,
            "Listener opened"
        );

        Ok(listener)
    }

    /// Close the socket, release the port and report the listener closed.
    ///
    /// Returns once the accept loop has exited, so the port is free when
    /// this resolves. Active connections are left to finish on their own.
    /// Closing twice is a no-op.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == ListenerState::Closed {
                return;
            }
            *state = ListenerState::Closed;
        }

        info!(key = %self.key, "Closing listener");

        let _ = self.shutdown.send(true);

        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(key = %self.key, error = %e, "Accept loop ended abnormally");
            }
        }

        self.ctx.ports.release(self.key.expose_port, self.id);
        self.ctx.observer.listener_closed(&self.labels);

        info!(
            key = %self.key,
            active_connections = self.active_connections(),
            "Listener closed"
        );
    }

    pub fn key(&self) -> &ListenerKey {
        &self.key
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address connections are relayed to.
    pub fn backend_addr(&self) -> &str {
        &self.backend_addr
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Number of connections currently relaying.
    pub fn active_connections(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn set_state(&self, next: ListenerState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ListenerState::Closed {
            *state = next;
        }
    }

    async fn accept_loop(self: Arc<Self>, socket: TcpListener, mut shutdown: watch::Receiver<bool>) {
        info!("Accepting connections");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("Listener shutdown requested");
                    break;
                }
                accepted = socket.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    tokio::spawn(
                        async move { listener.handle_accepted(stream, peer_addr).await }
                            .instrument(tracing::debug_span!("accepted", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        drop(socket);
        info!("Accept loop stopped");
    }

    async fn handle_accepted(self: Arc<Self>, inbound: TcpStream, peer_addr: SocketAddr) {
        let outbound = match backend::dial(&self.backend_addr, self.ctx.config.dial_timeout).await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %self.key,
                    backend_addr = %self.backend_addr,
                    error = %e,
                    "Failed to connect to backend"
                );
                return;
            }
        };

        if let Some(idle) = self.ctx.config.keepalive {
            for stream in [&inbound, &outbound] {
                if let Err(e) = backend::set_keepalive(stream, idle) {
                    debug!(error = %e, "Failed to enable keep-alive");
                }
            }
        }

        let (id, peer_worker) = self.ctx.workers.next_pair();
        Connection::new(id, peer_worker, peer_addr, inbound, outbound).run(self);
    }

    /// Track a new connection and report it opened.
    pub(crate) fn add_connection(&self, id: u64, peer_addr: SocketAddr) {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ActiveConnection {
                    peer_addr,
                    opened_at: Instant::now(),
                },
            );

        self.ctx.observer.connection_opened(&self.labels);
    }

    /// Stop tracking a connection and report it closed.
    ///
    /// Returns false if `id` was not tracked.
    pub(crate) fn remove_connection(&self, id: u64) -> bool {
        let removed = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        let Some(active) = removed else {
            return false;
        };

        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.ctx.observer.connection_closed(&self.labels);

        debug!(
            key = %self.key,
            connection = id,
            peer_addr = %active.peer_addr,
            duration_ms = u64::try_from(active.opened_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Connection removed"
        );
        true
    }

    pub(crate) fn record_relayed(&self, bytes_to_backend: u64, bytes_from_backend: u64) {
        self.stats
            .bytes_to_backend
            .fetch_add(bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(bytes_from_backend, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("local_addr", &self.local_addr)
            .field("backend_addr", &self.backend_addr)
            .field("state", &self.state())
            .finish()
    }
}
