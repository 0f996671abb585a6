//! Reconciliation planning primitives.
//!
//! A listener group converges its running listeners to a desired list by
//! comparing identities only:
//!
//! - **Desired state**: the keyed items the configuration asks for.
//! - **Current state**: the keys that are running right now.
//! - **Plan**: which keys to stop, which items to start, which to leave alone.
//!
//! # Invariants
//!
//! - Planning is pure and deterministic given the same inputs
//! - A key present in both states is never in `to_stop` or `to_start`
//! - Applying the same desired state twice yields an empty plan the second time

use std::collections::BTreeSet;

/// Outcome of diffing desired items against current keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan<K, V> {
    /// Running keys that are no longer desired, in key order.
    pub to_stop: Vec<K>,

    /// Desired items with no running counterpart, in desired order.
    pub to_start: Vec<(K, V)>,

    /// Keys that are both running and desired, in key order.
    pub unchanged: Vec<K>,
}

impl<K, V> ReconcilePlan<K, V> {
    /// Returns true if nothing needs to be stopped or started.
    pub fn is_noop(&self) -> bool {
        self.to_stop.is_empty() && self.to_start.is_empty()
    }
}

/// Compute the plan that converges `current` to `desired`.
///
/// When `desired` contains the same key more than once, the first
/// occurrence wins.
pub fn plan<K, V, C, D>(current: C, desired: D) -> ReconcilePlan<K, V>
where
    K: Ord + Clone,
    C: IntoIterator<Item = K>,
    D: IntoIterator<Item = (K, V)>,
{
    let current: BTreeSet<K> = current.into_iter().collect();

    let mut seen = BTreeSet::new();
    let mut to_start = Vec::new();
    let mut unchanged = BTreeSet::new();

    for (key, value) in desired {
        if !seen.insert(key.clone()) {
            continue;
        }
        if current.contains(&key) {
            unchanged.insert(key);
        } else {
            to_start.push((key, value));
        }
    }

    let to_stop = current
        .into_iter()
        .filter(|key| !seen.contains(key))
        .collect();

    ReconcilePlan {
        to_stop,
        to_start,
        unchanged: unchanged.into_iter().collect(),
    }
}
