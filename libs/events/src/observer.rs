//! Observer trait for listener and connection lifecycle events.

use std::sync::Arc;

use crate::types::ListenerLabels;

/// Receiver of proxy lifecycle events.
///
/// Implementations must be cheap and must not block: they are called
/// inline from accept loops and copy tasks. There is no error channel
/// back into the proxy path.
pub trait ProxyObserver: Send + Sync + 'static {
    /// A listener bound its socket and started accepting.
    fn listener_opened(&self, labels: &ListenerLabels);

    /// A listener closed its socket.
    fn listener_closed(&self, labels: &ListenerLabels);

    /// A connection was accepted and its backend dialed.
    fn connection_opened(&self, labels: &ListenerLabels);

    /// A connection finished (counted once, whichever direction ends first).
    fn connection_closed(&self, labels: &ListenerLabels);
}

/// Shared observer handle.
pub type SharedObserver = Arc<dyn ProxyObserver>;

/// Observer that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProxyObserver for NoopObserver {
    fn listener_opened(&self, _labels: &ListenerLabels) {}
    fn listener_closed(&self, _labels: &ListenerLabels) {}
    fn connection_opened(&self, _labels: &ListenerLabels) {}
    fn connection_closed(&self, _labels: &ListenerLabels) {}
}
