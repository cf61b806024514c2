//! Immutable snapshot cell.
//!
//! Config-derived state (rule sets, governance entities, provider tables)
//! is read-only to request threads. Writers publish a whole new snapshot;
//! readers grab the `Arc` once per request, so no in-flight request
//! observes a mid-operation change.

use std::sync::{Arc, RwLock};

/// A swap-on-write cell holding an `Arc<T>`.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    /// Current snapshot. Cheap: one lock acquisition and an Arc clone.
    pub fn load(&self) -> Arc<T> {
        self.inner.read().unwrap().clone()
    }

    /// Publish a new snapshot. Readers holding the old Arc keep it until
    /// they finish.
    pub fn store(&self, value: T) {
        *self.inner.write().unwrap() = Arc::new(value);
    }

    /// Publish an already-shared snapshot.
    pub fn store_arc(&self, value: Arc<T>) {
        *self.inner.write().unwrap() = value;
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
