//! Cooperative cancellation token.
//!
//! A token is triggered once and stays triggered. Interested parties either
//! await [`CancelToken::cancelled`] or register a synchronous callback with
//! [`CancelToken::on_cancel`]; callbacks run on the thread that calls
//! [`CancelToken::cancel`], after the internal lock is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, Callback>>,
}

/// Cloneable handle to a shared cancellation flag.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Trigger the token. Idempotent; only the first call runs callbacks.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.notify.notify_waiters();
        let callbacks: Vec<Callback> = match self.inner.callbacks.lock() {
            Ok(mut map) => map.drain().map(|(_, cb)| cb).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, cb)| cb).collect(),
        };
        for cb in callbacks {
            cb();
        }
    }

    /// Resolves when the token is triggered.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Run `callback` when the token fires.
    ///
    /// If the token already fired the callback runs immediately. Dropping the
    /// returned guard unsubscribes.
    pub fn on_cancel<F>(&self, callback: F) -> CancelGuard
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_cancelled() {
            callback();
            return CancelGuard::inert();
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut map = match self.inner.callbacks.lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.insert(id, Box::new(callback));
        }
        // cancel() may have drained the map before our insert landed
        if self.is_cancelled() {
            let late = match self.inner.callbacks.lock() {
                Ok(mut map) => map.remove(&id),
                Err(poisoned) => poisoned.into_inner().remove(&id),
            };
            if let Some(cb) = late {
                cb();
            }
            return CancelGuard::inert();
        }
        CancelGuard {
            token: Arc::downgrade(&self.inner),
            id: Some(id),
        }
    }

    /// A new token that fires when `self` fires, and can also fire on its own.
    pub fn child(&self) -> (CancelToken, CancelGuard) {
        let child = CancelToken::new();
        let handle = child.clone();
        let guard = self.on_cancel(move || handle.cancel());
        (child, guard)
    }

    /// Returns `true` if both handles point at the same token.
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Subscription returned by [`CancelToken::on_cancel`]; unsubscribes on drop.
#[must_use = "dropping the guard unsubscribes the callback"]
pub struct CancelGuard {
    token: Weak<CancelInner>,
    id: Option<u64>,
}

impl CancelGuard {
    fn inert() -> Self {
        Self {
            token: Weak::new(),
            id: None,
        }
    }

    /// Keep the callback registered for the lifetime of the token.
    pub fn forget(mut self) {
        self.id = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let (Some(id), Some(inner)) = (self.id.take(), self.token.upgrade()) else {
            return;
        };
        let removed = match inner.callbacks.lock() {
            Ok(mut map) => map.remove(&id),
            Err(poisoned) => poisoned.into_inner().remove(&id),
        };
        drop(removed);
    }
}
