//! # tsproxy-events
//!
//! Observability surface of the proxy core.
//!
//! ## Design Principles
//!
//! - The proxy path reports lifecycle events and never waits on, or fails
//!   because of, whoever consumes them
//! - Every event is labelled with the listener it belongs to, so listener
//!   and connection series can be joined
//! - Worker ids are process-wide and strictly increasing
//!
//! ## Events
//!
//! - `listener_opened` / `listener_closed`
//! - `connection_opened` / `connection_closed`
//!
//! [`ProxyMetrics`] is the Prometheus-backed observer used by the service;
//! [`NoopObserver`] is for callers that do not care.

mod error;
mod metrics;
mod observer;
mod types;
mod worker;

pub use error::MetricsError;
pub use metrics::ProxyMetrics;
pub use observer::{NoopObserver, ProxyObserver, SharedObserver};
pub use types::ListenerLabels;
pub use worker::WorkerIds;
