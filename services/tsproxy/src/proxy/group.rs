//! Listeners belonging to one owner.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use tsproxy_reconcile::plan;

use super::context::ProxyContext;
use super::listener::Listener;
use super::mapping::{ListenerKey, OwnerKey};

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Keys whose listener was started.
    pub started: Vec<ListenerKey>,
    /// Keys whose listener was stopped.
    pub stopped: Vec<ListenerKey>,
    /// Keys left running untouched.
    pub unchanged: Vec<ListenerKey>,
    /// Keys that could not be started, with the bind error.
    pub failed: Vec<(ListenerKey, String)>,
}

impl ReconcileOutcome {
    /// Returns true if no listener was started, stopped or attempted.
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.failed.is_empty()
    }
}

/// The running listeners of one owner, keyed by listener identity.
pub(crate) struct ProxyGroup {
    owner: OwnerKey,
    ctx: Arc<ProxyContext>,
    listeners: BTreeMap<ListenerKey, Arc<Listener>>,
}

impl ProxyGroup {
    pub fn new(owner: OwnerKey, ctx: Arc<ProxyContext>) -> Self {
        Self {
            owner,
            ctx,
            listeners: BTreeMap::new(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &ListenerKey> {
        self.listeners.keys()
    }

    pub fn listeners(&self) -> impl Iterator<Item = &Arc<Listener>> {
        self.listeners.values()
    }

    pub fn get(&self, key: &ListenerKey) -> Option<&Arc<Listener>> {
        self.listeners.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Converge running listeners to `desired`.
    ///
    /// Removed keys are stopped before new keys are started, so a port
    /// handed from one key to another within the group is free by the time
    /// it is bound again. A bind failure skips that key only.
    pub async fn reconcile(&mut self, desired: Vec<ListenerKey>) -> ReconcileOutcome {
        let plan = plan(
            self.listeners.keys().cloned(),
            desired.into_iter().map(|key| (key, ())),
        );

        if plan.is_noop() {
            debug!(owner = %self.owner, listeners = plan.unchanged.len(), "Group already converged");
            return ReconcileOutcome {
                unchanged: plan.unchanged,
                ..Default::default()
            };
        }

        let mut outcome = ReconcileOutcome {
            unchanged: plan.unchanged,
            ..Default::default()
        };

        for key in plan.to_stop {
            if let Some(listener) = self.listeners.remove(&key) {
                listener.close().await;
                outcome.stopped.push(key);
            }
        }

        for (key, ()) in plan.to_start {
            match Listener::start(self.owner.clone(), key.clone(), Arc::clone(&self.ctx)).await {
                Ok(listener) => {
                    self.listeners.insert(key.clone(), listener);
                    outcome.started.push(key);
                }
                Err(e) => {
                    warn!(
                        owner = %self.owner,
                        key = %key,
                        reason_code = e.reason_code(),
                        error = %e,
                        "Failed to start listener"
                    );
                    outcome.failed.push((key, e.to_string()));
                }
            }
        }

        info!(
            owner = %self.owner,
            started = outcome.started.len(),
            stopped = outcome.stopped.len(),
            unchanged = outcome.unchanged.len(),
            failed = outcome.failed.len(),
            "Group reconciled"
        );

        outcome
    }

    /// Stop every listener in the group.
    pub async fn close(&mut self) -> Vec<ListenerKey> {
        let listeners = std::mem::take(&mut self.listeners);
        let mut stopped = Vec::with_capacity(listeners.len());
        for (key, listener) in listeners {
            listener.close().await;
            stopped.push(key);
        }

        info!(owner = %self.owner, stopped = stopped.len(), "Group closed");
        stopped
    }
}
