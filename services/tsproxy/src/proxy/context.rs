//! State shared by the manager, its groups and their listeners.

use std::sync::Arc;

use tsproxy_events::{SharedObserver, WorkerIds};

use super::backend::BackendResolver;
use super::listener::ListenerConfig;
use super::ports::PortTable;

pub(crate) struct ProxyContext {
    pub config: ListenerConfig,
    pub observer: SharedObserver,
    pub workers: WorkerIds,
    pub resolver: Arc<dyn BackendResolver>,
    pub ports: PortTable,
}
