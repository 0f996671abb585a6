//! Worker id allocation.
//!
//! Worker ids tag the accept loop of a listener and each direction of a
//! connection so their log lines can be correlated. Ids start at 1 and are
//! strictly increasing for the lifetime of the allocator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;

/// Thread-safe allocator for worker ids.
///
/// Clones share the same sequence.
#[derive(Debug, Clone, Default)]
pub struct WorkerIds {
    last: Arc<AtomicU64>,
    allocated: Option<Counter>,
}

impl WorkerIds {
    /// Create a new allocator with no metrics attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator that also counts allocations into `counter`.
    pub fn with_counter(counter: Counter) -> Self {
        Self {
            last: Arc::new(AtomicU64::new(0)),
            allocated: Some(counter),
        }
    }

    /// Allocate a single id.
    pub fn next(&self) -> u64 {
        let id = self.last.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(counter) = &self.allocated {
            counter.inc();
        }
        id
    }

    /// Allocate two consecutive ids in one step.
    ///
    /// The first id of the pair doubles as the connection's correlation id.
    pub fn next_pair(&self) -> (u64, u64) {
        let first = self.last.fetch_add(2, Ordering::SeqCst) + 1;
        if let Some(counter) = &self.allocated {
            counter.inc_by(2);
        }
        (first, first + 1)
    }

    /// Last id handed out (0 if none).
    pub fn last(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}
