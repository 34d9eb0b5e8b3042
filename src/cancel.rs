//! Per-request operation contexts.
//!
//! Each dispatched request gets a child [`CancellationToken`] of the
//! registry's root token, keyed by its operation ID. Cancelling one
//! operation never touches another; cancelling the root (on shutdown)
//! reaches all of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

struct Entry {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Inner {
    next_generation: u64,
    active: HashMap<String, Entry>,
}

pub struct OperationRegistry {
    root: CancellationToken,
    inner: Mutex<Inner>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Registers a fresh operation context under `operation_id`.
    ///
    /// An operation already registered under the same ID is cancelled and
    /// replaced.
    pub fn begin(self: &Arc<Self>, operation_id: &str) -> OperationGuard {
        let token = self.root.child_token();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let previous = inner.active.insert(
            operation_id.to_string(),
            Entry {
                generation,
                token: token.clone(),
            },
        );
        drop(inner);

        if let Some(previous) = previous {
            tracing::warn!(
                operation_id,
                "operation ID reused while in flight, cancelling the earlier run"
            );
            previous.token.cancel();
        }

        OperationGuard {
            registry: Arc::clone(self),
            operation_id: operation_id.to_string(),
            generation,
            token,
        }
    }

    /// Cancels one operation. Returns `false` when the ID is not in flight.
    pub fn cancel(&self, operation_id: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.active.get(operation_id) {
            Some(entry) => {
                entry.token.cancel();
                tracing::info!(operation_id, "operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight operation and returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in inner.active.values() {
            entry.token.cancel();
        }
        if !inner.active.is_empty() {
            tracing::info!(count = inner.active.len(), "cancelled all operations");
        }
        inner.active.len()
    }

    /// Cancels the root token. Operations begun afterwards start cancelled.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn active(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = inner.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn finish(&self, operation_id: &str, generation: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner
            .active
            .get(operation_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            inner.active.remove(operation_id);
        }
    }
}

/// Keeps an operation registered for as long as it lives. Dropping it
/// cancels the token and unregisters the operation.
pub struct OperationGuard {
    registry: Arc<OperationRegistry>,
    operation_id: String,
    generation: u64,
    token: CancellationToken,
}

impl OperationGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.token.cancel();
        self.registry.finish(&self.operation_id, self.generation);
    }
}
