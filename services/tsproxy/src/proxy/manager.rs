//! Process-wide proxy manager.
//!
//! The manager owns every [`ProxyGroup`] and the global exposed-port table.
//! `apply` is the single entry point for configuration changes: it validates
//! a whole mapping list, rejects it if any exposed port belongs to another
//! owner, and only then lets the owner's group reconcile.
//!
//! Applies are serialized on the group table lock, so validation, conflict
//! checks and port registration for one call are atomic with respect to
//! every other call, for the same owner or a different one.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tsproxy_events::{NoopObserver, SharedObserver, WorkerIds};

use super::backend::{BackendResolver, ServiceDnsResolver};
use super::context::ProxyContext;
use super::error::ApplyError;
use super::group::{ProxyGroup, ReconcileOutcome};
use super::listener::{ListenerConfig, ListenerState};
use super::mapping::{validate, ListenerKey, Mapping, OwnerKey};
use super::ports::PortTable;

/// Point-in-time view of one listener.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerSnapshot {
    pub key: String,
    pub expose_port: u16,
    pub local_addr: SocketAddr,
    pub backend: String,
    pub state: ListenerState,
    pub active_connections: usize,
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub dial_failures: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// Point-in-time view of the whole manager.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerSnapshot {
    /// Owner to its listeners, ordered by owner then key.
    pub groups: BTreeMap<String, Vec<ListenerSnapshot>>,
    /// Exposed port to owning owner.
    pub ports: BTreeMap<u16, String>,
}

impl ManagerSnapshot {
    pub fn listener_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// Builder for [`Manager`].
pub struct ManagerBuilder {
    config: ListenerConfig,
    observer: SharedObserver,
    workers: WorkerIds,
    resolver: Arc<dyn BackendResolver>,
    debug_dump: bool,
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self {
            config: ListenerConfig::default(),
            observer: Arc::new(NoopObserver),
            workers: WorkerIds::new(),
            resolver: Arc::new(ServiceDnsResolver::new()),
            debug_dump: false,
        }
    }
}

impl ManagerBuilder {
    pub fn config(mut self, config: ListenerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sink for listener and connection events.
    pub fn observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn worker_ids(mut self, workers: WorkerIds) -> Self {
        self.workers = workers;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn BackendResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Log the full manager state after every apply.
    pub fn debug_dump(mut self, enabled: bool) -> Self {
        self.debug_dump = enabled;
        self
    }

    pub fn build(self) -> Manager {
        Manager {
            ctx: Arc::new(ProxyContext {
                config: self.config,
                observer: self.observer,
                workers: self.workers,
                resolver: self.resolver,
                ports: PortTable::new(),
            }),
            groups: Mutex::new(BTreeMap::new()),
            debug_dump: self.debug_dump,
        }
    }
}

/// Owns all proxy groups and the exposed-port table.
pub struct Manager {
    ctx: Arc<ProxyContext>,
    groups: Mutex<BTreeMap<OwnerKey, ProxyGroup>>,
    debug_dump: bool,
}

impl Manager {
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    /// Converge `owner`'s listeners to `mappings`.
    ///
    /// An empty list removes the owner's group. Validation and port
    /// conflicts reject the whole call without touching any listener; a
    /// bind failure only skips that mapping and shows up in
    /// [`ReconcileOutcome::failed`].
    pub async fn apply(
        &self,
        owner: &OwnerKey,
        mappings: &[Mapping],
    ) -> Result<ReconcileOutcome, ApplyError> {
        let mut groups = self.groups.lock().await;

        if mappings.is_empty() {
            let outcome = match groups.remove(owner) {
                Some(mut group) => {
                    info!(owner = %owner, "Removing proxy group");
                    ReconcileOutcome {
                        stopped: group.close().await,
                        ..Default::default()
                    }
                }
                None => {
                    debug!(owner = %owner, "No proxy group to remove");
                    ReconcileOutcome::default()
                }
            };
            self.dump_state(&groups);
            return Ok(outcome);
        }

        let keys = validate(owner, mappings)?;
        self.check_conflicts(owner, &keys)?;

        if groups.contains_key(owner) {
            info!(owner = %owner, mappings = keys.len(), "Updating proxy group");
        } else {
            info!(owner = %owner, mappings = keys.len(), "Creating proxy group");
        }
        let group = groups
            .entry(owner.clone())
            .or_insert_with(|| ProxyGroup::new(owner.clone(), Arc::clone(&self.ctx)));

        let outcome = group.reconcile(keys).await;
        if group.is_empty() {
            // Every bind failed.
            groups.remove(owner);
        }

        self.dump_state(&groups);
        Ok(outcome)
    }

    fn check_conflicts(&self, owner: &OwnerKey, keys: &[ListenerKey]) -> Result<(), ApplyError> {
        for key in keys {
            if let Some(holder) = self.ctx.ports.owner_of(key.expose_port) {
                if &holder != owner {
                    warn!(
                        owner = %owner,
                        port = key.expose_port,
                        holder = %holder,
                        reason_code = "port_conflict",
                        "Exposed port is owned by another group"
                    );
                    return Err(ApplyError::PortConflict {
                        port: key.expose_port,
                        owner: holder,
                    });
                }
            }
        }
        Ok(())
    }

    /// True iff no listener holds `port`.
    pub fn port_available(&self, port: u16) -> bool {
        self.ctx.ports.is_available(port)
    }

    /// Owner currently holding `port`.
    pub fn port_owner(&self, port: u16) -> Option<OwnerKey> {
        self.ctx.ports.owner_of(port)
    }

    /// Owners with at least one running listener.
    pub async fn owners(&self) -> Vec<OwnerKey> {
        self.groups.lock().await.keys().cloned().collect()
    }

    /// Running listener keys of `owner`, in key order.
    pub async fn listener_keys(&self, owner: &OwnerKey) -> Vec<ListenerKey> {
        self.groups
            .lock()
            .await
            .get(owner)
            .map(|group| group.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Active connection count of the listener for `key`, if it is running.
    pub async fn active_connections(&self, key: &ListenerKey) -> Option<usize> {
        let groups = self.groups.lock().await;
        groups
            .values()
            .find_map(|group| group.get(key))
            .map(|listener| listener.active_connections())
    }

    pub async fn snapshot(&self) -> ManagerSnapshot {
        let groups = self.groups.lock().await;
        self.snapshot_of(&groups)
    }

    fn snapshot_of(&self, groups: &BTreeMap<OwnerKey, ProxyGroup>) -> ManagerSnapshot {
        let groups = groups
            .iter()
            .map(|(owner, group)| {
                let listeners = group
                    .listeners()
                    .map(|listener| {
                        let stats = listener.stats();
                        ListenerSnapshot {
                            key: listener.key().to_string(),
                            expose_port: listener.key().expose_port,
                            local_addr: listener.local_addr(),
                            backend: listener.backend_addr().to_string(),
                            state: listener.state(),
                            active_connections: listener.active_connections(),
                            connections_accepted: stats.connections_accepted.load(Ordering::Relaxed),
                            connections_closed: stats.connections_closed.load(Ordering::Relaxed),
                            dial_failures: stats.backend_failed.load(Ordering::Relaxed),
                            bytes_to_backend: stats.bytes_to_backend.load(Ordering::Relaxed),
                            bytes_from_backend: stats.bytes_from_backend.load(Ordering::Relaxed),
                        }
                    })
                    .collect();
                (owner.to_string(), listeners)
            })
            .collect();

        ManagerSnapshot {
            groups,
            ports: self.ctx.ports.snapshot(),
        }
    }

    fn dump_state(&self, groups: &BTreeMap<OwnerKey, ProxyGroup>) {
        if !self.debug_dump {
            return;
        }
        match serde_json::to_string(&self.snapshot_of(groups)) {
            Ok(state) => info!(state = %state, "Manager state"),
            Err(e) => warn!(error = %e, "Failed to serialize manager state"),
        }
    }

    /// Close every group. The manager stays usable afterwards.
    pub async fn shutdown(&self) {
        let mut groups = self.groups.lock().await;
        let count = groups.len();
        for (_, mut group) in std::mem::take(&mut *groups) {
            group.close().await;
        }
        info!(groups = count, "Manager shut down");
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::builder().build()
    }
}
