//! Test harness for tsproxy integration tests.
//!
//! Builds a manager bound to loopback that dials every backend on
//! `127.0.0.1`, so a mapping's service port is simply the port of a local
//! backend spawned by the test.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tsproxy::{FixedHostResolver, ListenerConfig, Manager, Mapping, OwnerKey};
use tsproxy_events::ProxyMetrics;

#[allow(unused_imports)]
pub use tsproxy_testing::{eventually, free_port, EventKind, RecordingObserver, TcpEchoBackend};

pub const WAIT: Duration = Duration::from_secs(2);

#[allow(dead_code)]
pub struct ProxyHandle {
    pub manager: Arc<Manager>,
    pub observer: Arc<RecordingObserver>,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub fn spawn() -> Self {
        let observer = RecordingObserver::new();
        let manager = Manager::builder()
            .config(loopback_config())
            .observer(observer.clone())
            .resolver(Arc::new(FixedHostResolver::new("127.0.0.1")))
            .build();

        Self {
            manager: Arc::new(manager),
            observer,
        }
    }

    /// Same as [`ProxyHandle::spawn`], reporting into Prometheus metrics instead.
    pub fn spawn_with_metrics() -> (Arc<Manager>, Arc<ProxyMetrics>) {
        let metrics = Arc::new(ProxyMetrics::new());
        let manager = Manager::builder()
            .config(loopback_config())
            .observer(metrics.clone())
            .worker_ids(metrics.worker_ids())
            .resolver(Arc::new(FixedHostResolver::new("127.0.0.1")))
            .build();
        (Arc::new(manager), metrics)
    }
}

pub fn loopback_config() -> ListenerConfig {
    ListenerConfig {
        bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        dial_timeout: Duration::from_millis(500),
        keepalive: Some(Duration::from_secs(30)),
    }
}

#[allow(dead_code)]
pub fn owner(raw: &str) -> OwnerKey {
    raw.parse().unwrap()
}

#[allow(dead_code)]
pub fn mapping(service: &str, service_port: u16, expose_port: u16) -> Mapping {
    Mapping::new(service, i32::from(service_port), i32::from(expose_port))
}

pub fn proxy_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

#[allow(dead_code)]
pub async fn connect(port: u16) -> io::Result<TcpStream> {
    timeout(WAIT, TcpStream::connect(proxy_addr(port)))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))?
}

/// Write `payload` and read back exactly as many bytes.
#[allow(dead_code)]
pub async fn echo(stream: &mut TcpStream, payload: &[u8]) -> io::Result<Vec<u8>> {
    timeout(WAIT, async {
        stream.write_all(payload).await?;
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "echo timeout"))?
}

/// Connect, echo `payload` once, and close.
#[allow(dead_code)]
pub async fn roundtrip(port: u16, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut stream = connect(port).await?;
    echo(&mut stream, payload).await
}

/// Read until the peer closes; errors count as closed.
#[allow(dead_code)]
pub async fn read_to_close(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    timeout(WAIT, async {
        let mut buf = Vec::new();
        match stream.read_to_end(&mut buf).await {
            Ok(_) => Ok(buf),
            Err(_) => Ok(buf),
        }
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer did not close"))?
}
