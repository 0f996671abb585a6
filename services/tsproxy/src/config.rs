//! Proxy configuration.
//!
//! Everything is read from `TSPROXY_*` environment variables.

use std::io::IsTerminal;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::proxy::{
    BackendResolver, FixedHostResolver, ListenerConfig, ServiceDnsResolver, DEFAULT_DIAL_TIMEOUT,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines.
    Json,
    /// Human-readable text.
    Text,
    /// Text on a terminal, JSON otherwise.
    Auto,
}

impl LogFormat {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" | "console" => Ok(Self::Text),
            "auto" | "" => Ok(Self::Auto),
            other => bail!("TSPROXY_LOG_FORMAT must be json, text or auto, got '{other}'."),
        }
    }

    /// Whether output should be JSON on the current stdout.
    pub fn is_json(self) -> bool {
        match self {
            Self::Json => true,
            Self::Text => false,
            Self::Auto => !std::io::stdout().is_terminal(),
        }
    }
}

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Desired-state file (JSON, or TOML with a `.toml` extension).
    pub config_path: PathBuf,

    /// How often the desired-state file is re-read.
    pub poll_interval: Duration,

    /// Host address exposed ports bind on.
    pub bind_host: IpAddr,

    /// Metrics/health endpoint address; `None` disables it.
    pub metrics_addr: Option<SocketAddr>,

    /// Backend dial timeout.
    pub dial_timeout: Duration,

    /// TCP keep-alive idle time; `None` disables keep-alive.
    pub keepalive: Option<Duration>,

    /// Domain suffix appended to `service.namespace`.
    pub service_suffix: Option<String>,

    /// Dial every backend on this host instead of its service name.
    pub backend_host: Option<String>,

    /// Dump manager state after every apply.
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_path = lookup("TSPROXY_CONFIG")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .context("Missing desired-state file. Set TSPROXY_CONFIG.")?;

        let poll_interval_ms: u64 = lookup("TSPROXY_POLL_INTERVAL_MS")
            .map(|v| v.parse())
            .transpose()
            .context("TSPROXY_POLL_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(2000);
        let poll_interval = Duration::from_millis(poll_interval_ms.max(100));

        let bind_host: IpAddr = lookup("TSPROXY_BIND_HOST")
            .map(|v| v.parse())
            .transpose()
            .context("TSPROXY_BIND_HOST must be an IP address.")?
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let metrics_addr = match lookup("TSPROXY_METRICS_ADDR") {
            Some(v) if v.eq_ignore_ascii_case("off") || v.is_empty() => None,
            Some(v) => Some(
                v.parse()
                    .context("TSPROXY_METRICS_ADDR must be host:port or 'off'.")?,
            ),
            None => Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080)),
        };

        let dial_timeout = lookup("TSPROXY_DIAL_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("TSPROXY_DIAL_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(|ms| Duration::from_millis(ms.max(1)))
            .unwrap_or(DEFAULT_DIAL_TIMEOUT);

        let keepalive_secs: u64 = lookup("TSPROXY_KEEPALIVE_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("TSPROXY_KEEPALIVE_SECS must be an integer (seconds).")?
            .unwrap_or(30);
        let keepalive = flag(&lookup, "TSPROXY_KEEPALIVE")
            .then(|| Duration::from_secs(keepalive_secs.max(1)));

        let service_suffix = lookup("TSPROXY_SERVICE_SUFFIX").filter(|v| !v.is_empty());
        let backend_host = lookup("TSPROXY_BACKEND_HOST").filter(|v| !v.is_empty());

        let debug = flag(&lookup, "TSPROXY_DEBUG");

        let log_level = lookup("TSPROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_format = lookup("TSPROXY_LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .transpose()?
            .unwrap_or(LogFormat::Auto);

        Ok(Self {
            config_path,
            poll_interval,
            bind_host,
            metrics_addr,
            dial_timeout,
            keepalive,
            service_suffix,
            backend_host,
            debug,
            log_level,
            log_format,
        })
    }

    /// Listener settings for the proxy core.
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_host: self.bind_host,
            dial_timeout: self.dial_timeout,
            keepalive: self.keepalive,
        }
    }

    /// Backend resolver: a fixed host if configured, service DNS names otherwise.
    pub fn resolver(&self) -> Arc<dyn BackendResolver> {
        match (&self.backend_host, &self.service_suffix) {
            (Some(host), _) => Arc::new(FixedHostResolver::new(host.clone())),
            (None, Some(suffix)) => Arc::new(ServiceDnsResolver::with_suffix(suffix.clone())),
            (None, None) => Arc::new(ServiceDnsResolver::new()),
        }
    }
}

fn flag<F>(lookup: &F, name: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::proxy::ListenerKey;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("TSPROXY_CONFIG", "/etc/tsproxy/proxies.json")]).unwrap();

        assert_eq!(config.config_path, PathBuf::from("/etc/tsproxy/proxies.json"));
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.bind_host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.metrics_addr, Some("0.0.0.0:8080".parse().unwrap()));
        assert_eq!(config.dial_timeout, DEFAULT_DIAL_TIMEOUT);
        assert!(config.keepalive.is_none());
        assert!(!config.debug);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Auto);
    }

    #[test]
    fn test_missing_config_path() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("TSPROXY_CONFIG"));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("TSPROXY_CONFIG", "proxies.toml"),
            ("TSPROXY_POLL_INTERVAL_MS", "10"),
            ("TSPROXY_BIND_HOST", "127.0.0.1"),
            ("TSPROXY_METRICS_ADDR", "off"),
            ("TSPROXY_DIAL_TIMEOUT_MS", "250"),
            ("TSPROXY_KEEPALIVE", "true"),
            ("TSPROXY_KEEPALIVE_SECS", "15"),
            ("TSPROXY_DEBUG", "1"),
            ("TSPROXY_LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.bind_host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(config.metrics_addr.is_none());
        assert_eq!(config.dial_timeout, Duration::from_millis(250));
        assert_eq!(config.keepalive, Some(Duration::from_secs(15)));
        assert!(config.debug);
        assert!(config.log_format.is_json());

        let listener = config.listener_config();
        assert_eq!(listener.dial_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("TSPROXY_CONFIG", "p.json"), ("TSPROXY_BIND_HOST", "nope")]).is_err());
        assert!(load(&[("TSPROXY_CONFIG", "p.json"), ("TSPROXY_POLL_INTERVAL_MS", "x")]).is_err());
        assert!(load(&[("TSPROXY_CONFIG", "p.json"), ("TSPROXY_LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn test_resolver_selection() {
        let key = ListenerKey::new("ns", "backend1", 8080, 9001);

        let config = load(&[("TSPROXY_CONFIG", "p.json")]).unwrap();
        assert_eq!(config.resolver().backend_address(&key), "backend1.ns:8080");

        let config = load(&[
            ("TSPROXY_CONFIG", "p.json"),
            ("TSPROXY_SERVICE_SUFFIX", "svc.cluster.local"),
        ])
        .unwrap();
        assert_eq!(
            config.resolver().backend_address(&key),
            "backend1.ns.svc.cluster.local:8080"
        );

        let config = load(&[
            ("TSPROXY_CONFIG", "p.json"),
            ("TSPROXY_SERVICE_SUFFIX", "svc.cluster.local"),
            ("TSPROXY_BACKEND_HOST", "127.0.0.1"),
        ])
        .unwrap();
        assert_eq!(config.resolver().backend_address(&key), "127.0.0.1:8080");
    }
}
