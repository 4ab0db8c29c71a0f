//! Cancellation tokens for in-flight parse tasks
//!
//! Every parse task gets a token keyed by the record it is working on. Removing
//! or superseding the record cancels the token; the task checks it before
//! writing anything back to the store and can also await it to stop early.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;
use upload_model::RecordId;

/// Cancellation token for cooperative task cancellation
///
/// Clones share the same cancellation state.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new token in the non-cancelled state
    pub fn new() -> Self {
        Self { inner: Arc::new(TokenInner::default()) }
    }

    /// Cancel this token and wake every task waiting in [`cancelled`].
    ///
    /// Idempotent.
    ///
    /// [`cancelled`]: CancellationToken::cancelled
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Whether `other` is a clone of this token.
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks the live token of each record that has a parse in flight.
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<RecordId, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for `id`.
    ///
    /// A token already registered for the same record is cancelled, since the
    /// work it guarded has been superseded.
    pub fn register(&self, id: RecordId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.tokens.lock().insert(id, token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Cancel and forget the token for `id`. Returns `true` if one was found.
    pub fn cancel(&self, id: RecordId) -> bool {
        match self.tokens.lock().remove(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered token. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.tokens.lock().drain().map(|(_, token)| token).collect();
        for token in &drained {
            token.cancel();
        }
        drained.len()
    }

    /// Called by a finished task. Only removes the entry if it still belongs to
    /// `token`, so a newer task for the same record keeps its registration.
    pub fn complete(&self, id: RecordId, token: &CancellationToken) -> bool {
        let mut tokens = self.tokens.lock();
        match tokens.get(&id) {
            Some(current) if current.same_as(token) => {
                tokens.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: RecordId) -> Option<CancellationToken> {
        self.tokens.lock().get(&id).cloned()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.tokens.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}
