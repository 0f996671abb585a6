//! Backend addressing and dialing.
//!
//! A listener forwards every accepted connection to exactly one backend
//! address, derived from its key when the listener is created:
//! `service.namespace[.suffix]:port` by default.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::mapping::ListenerKey;

/// Default connect timeout for backend connections.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps a listener key to the `host:port` its connections are relayed to.
pub trait BackendResolver: Send + Sync + 'static {
    fn backend_address(&self, key: &ListenerKey) -> String;
}

/// Resolves backends as in-cluster service names.
#[derive(Debug, Clone, Default)]
pub struct ServiceDnsResolver {
    suffix: Option<String>,
}

impl ServiceDnsResolver {
    /// Create a resolver producing `service.namespace:port`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a domain suffix, e.g. `svc.cluster.local`.
    pub fn with_suffix(suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        let suffix = suffix.trim_matches('.').to_string();
        Self {
            suffix: (!suffix.is_empty()).then_some(suffix),
        }
    }
}

impl BackendResolver for ServiceDnsResolver {
    fn backend_address(&self, key: &ListenerKey) -> String {
        match &self.suffix {
            Some(suffix) => format!(
                "{}.{}.{}:{}",
                key.service_name, key.namespace, suffix, key.service_port
            ),
            None => format!("{}.{}:{}", key.service_name, key.namespace, key.service_port),
        }
    }
}

/// Sends every backend to one host, keeping the service port.
///
/// Useful when the proxy runs outside the cluster network.
#[derive(Debug, Clone)]
pub struct FixedHostResolver {
    host: String,
}

impl FixedHostResolver {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl BackendResolver for FixedHostResolver {
    fn backend_address(&self, key: &ListenerKey) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, key.service_port)
        } else {
            format!("{}:{}", self.host, key.service_port)
        }
    }
}

/// Connect to a backend, giving up after `dial_timeout`.
pub(crate) async fn dial(addr: &str, dial_timeout: Duration) -> io::Result<TcpStream> {
    debug!(backend_addr = %addr, "Connecting to backend");

    match timeout(dial_timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    }
}

/// Enable TCP keep-alive with the given idle time.
pub(crate) fn set_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))
}
