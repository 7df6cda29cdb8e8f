//! Cooperative cancellation for tile jobs
//!
//! A [`CancelToken`] is a shared flag. The dispatcher reads it only when it
//! is about to hand a unit another tile; work already running is never
//! interrupted. Waiters subscribe to be woken the moment the flag flips.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: HashMap<u64, Sender<()>>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    listeners: Mutex<Listeners>,
}

/// Shared cancellation signal
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let senders: Vec<Sender<()>> = {
            let mut listeners = self.inner.listeners.lock();
            listeners.senders.drain().map(|(_, tx)| tx).collect()
        };
        for tx in senders {
            let _ = tx.try_send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Number of live subscriptions
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().senders.len()
    }

    pub(crate) fn subscribe(&self) -> CancelListener {
        let (tx, rx) = bounded(1);
        let mut listeners = self.inner.listeners.lock();
        let id = listeners.next_id;
        listeners.next_id += 1;

        if self.inner.cancelled.load(Ordering::SeqCst) {
            let _ = tx.try_send(());
        } else {
            listeners.senders.insert(id, tx);
        }

        CancelListener {
            token: self.clone(),
            id,
            rx,
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Subscription to a token; unregisters itself on drop
pub(crate) struct CancelListener {
    token: CancelToken,
    id: u64,
    rx: Receiver<()>,
}

impl CancelListener {
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

impl Drop for CancelListener {
    fn drop(&mut self) {
        self.token.inner.listeners.lock().senders.remove(&self.id);
    }
}
