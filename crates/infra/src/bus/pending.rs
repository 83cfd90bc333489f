//! Pending-operation counter.
//!
//! Counts messages that were accepted by the bus but not yet fully handled.
//! `flush` waits on it reaching zero.
//!
//! A message is counted once: either when its commit reserves it, or when the
//! relay releases it without a reservation (deferred, redelivered or written
//! by another process).

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use eventide_core::MessageId;
use tokio::sync::watch;
use tracing::error;

use crate::cancel::Cancellation;

/// Shared counter. Clones observe the same count.
#[derive(Debug, Clone)]
pub struct PendingOperations {
    count: std::sync::Arc<watch::Sender<i64>>,
    reserved: std::sync::Arc<Mutex<HashSet<MessageId>>>,
}

impl Default for PendingOperations {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingOperations {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            count: std::sync::Arc::new(tx),
            reserved: std::sync::Arc::default(),
        }
    }

    /// Count `ids` now, ahead of their release by the relay.
    pub fn reserve(&self, ids: &[MessageId]) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(ids.iter().copied());
        self.increment_by(ids.len());
    }

    /// Undo [`reserve`](Self::reserve) for a commit that failed.
    pub fn unreserve(&self, ids: &[MessageId]) {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = ids.iter().filter(|id| reserved.remove(id)).count();
        drop(reserved);
        self.decrement_by(dropped);
    }

    /// Account for a message leaving the relay; counts it unless it was reserved.
    pub fn released(&self, id: MessageId) {
        let was_reserved = self
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if !was_reserved {
            self.increment_by(1);
        }
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn increment_by(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.count.send_modify(|c| *c += n as i64);
    }

    pub fn decrement_by(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.count.send_modify(|c| {
            *c -= n as i64;
            if *c < 0 {
                error!(count = *c, "pending operation counter went negative");
                *c = 0;
            }
        });
    }

    pub fn count(&self) -> u64 {
        (*self.count.borrow()).max(0) as u64
    }

    /// Resolve once nothing is pending (immediately if nothing is).
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn wait_for_zero(&self, cancel: &Cancellation) -> bool {
        let mut rx = self.count.subscribe();
        tokio::select! {
            biased;
            reached = rx.wait_for(|c| *c <= 0) => reached.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }
}

/// Decrements the counter when dropped, including on unwind.
#[derive(Debug)]
pub struct PendingGuard {
    pending: PendingOperations,
    n: usize,
}

impl PendingGuard {
    pub fn new(pending: PendingOperations, n: usize) -> Self {
        Self { pending, n }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.decrement_by(self.n);
    }
}
