//! Global exposed-port ownership table.
//!
//! Every running listener holds exactly one slot, keyed by its exposed
//! port. A slot records which listener instance holds it, so a late release
//! from a replaced listener can never evict its successor.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use tracing::warn;

use super::mapping::{ListenerKey, OwnerKey};

/// Occupant of one exposed port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PortSlot {
    pub owner: OwnerKey,
    pub key: ListenerKey,
    pub listener_id: u64,
}

/// Exposed port to owning listener, across all groups.
#[derive(Debug, Default)]
pub(crate) struct PortTable {
    slots: RwLock<HashMap<u16, PortSlot>>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner currently holding `port`, if any.
    pub fn owner_of(&self, port: u16) -> Option<OwnerKey> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots.get(&port).map(|slot| slot.owner.clone())
    }

    pub fn is_available(&self, port: u16) -> bool {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        !slots.contains_key(&port)
    }

    /// Claim the slot for `slot.key.expose_port`.
    pub fn register(&self, slot: PortSlot) {
        let port = slot.key.expose_port;
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slots.insert(port, slot) {
            warn!(
                port,
                previous_key = %previous.key,
                previous_owner = %previous.owner,
                "Port slot was still held by another listener"
            );
        }
    }

    /// Release `port` if it is still held by `listener_id`.
    pub fn release(&self, port: u16, listener_id: u64) -> bool {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.get(&port) {
            Some(slot) if slot.listener_id == listener_id => {
                slots.remove(&port);
                true
            }
            _ => false,
        }
    }

    /// Port to owner, ordered by port.
    pub fn snapshot(&self) -> BTreeMap<u16, String> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .iter()
            .map(|(port, slot)| (*port, slot.owner.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(owner: &str, port: u16, id: u64) -> PortSlot {
        let owner: OwnerKey = owner.parse().unwrap();
        PortSlot {
            key: ListenerKey::new(owner.namespace.clone(), "svc", 80, port),
            owner,
            listener_id: id,
        }
    }

    #[test]
    fn test_register_and_release() {
        let table = PortTable::new();
        assert!(table.is_available(9001));

        table.register(slot("ns/a", 9001, 1));
        assert!(!table.is_available(9001));
        assert_eq!(table.owner_of(9001), Some(OwnerKey::new("ns", "a")));

        assert!(table.release(9001, 1));
        assert!(table.is_available(9001));
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn test_release_ignores_stale_listener() {
        let table = PortTable::new();
        table.register(slot("ns/a", 9001, 1));
        table.register(slot("ns/a", 9001, 2));

        assert!(!table.release(9001, 1));
        assert!(!table.is_available(9001));
        assert!(table.release(9001, 2));
    }

    #[test]
    fn test_snapshot_is_port_ordered() {
        let table = PortTable::new();
        table.register(slot("ns/b", 9002, 2));
        table.register(slot("ns/a", 9001, 1));

        let snapshot: Vec<_> = table.snapshot().into_iter().collect();
        assert_eq!(
            snapshot,
            vec![(9001, "ns/a".to_string()), (9002, "ns/b".to_string())]
        );
    }
}
