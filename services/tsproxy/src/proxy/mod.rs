//! Dynamic L4 TCP proxy core.
//!
//! This module provides:
//! - Owner-scoped listener groups reconciled against desired mappings
//! - Global exposed-port ownership with cross-owner conflict detection
//! - Per-port accept loops dialing one backend service each
//! - Raw bidirectional byte relay per connection
//!
//! ## Architecture
//!
//! ```text
//! apply(owner, mappings) -> Manager -> ProxyGroup -> Listener -> Connection
//!                              |                        |           |
//!                          PortTable              accept loop   2 relay tasks
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tsproxy::proxy::{Manager, Mapping, OwnerKey};
//!
//! let manager = Manager::builder().build();
//! let owner: OwnerKey = "ns/a".parse()?;
//! manager.apply(&owner, &[Mapping::new("backend1", 8080, 9001)]).await?;
//! ```

mod backend;
mod connection;
mod context;
mod error;
mod group;
mod listener;
mod manager;
mod mapping;
mod ports;

pub use backend::{BackendResolver, FixedHostResolver, ServiceDnsResolver, DEFAULT_DIAL_TIMEOUT};
pub use error::{ApplyError, ListenerError, OwnerKeyError};
pub use group::ReconcileOutcome;
pub use listener::{Listener, ListenerConfig, ListenerState, ListenerStats};
pub use manager::{ListenerSnapshot, Manager, ManagerBuilder, ManagerSnapshot};
pub use mapping::{validate, ListenerKey, Mapping, OwnerKey, PORT_MAX, PORT_MIN};
