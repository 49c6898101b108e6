//! Connection task scope.
//!
//! Every connection task holds an [`ActiveGuard`] for as long as it runs,
//! teardown included.  Shutting the scope down broadcasts a cooperative
//! teardown signal and [`Scope::drained`] resolves only once every guard is
//! gone, so a filesystem shutdown cannot report completion while any
//! connection still has a reply in flight or its balancing close pending.

use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use tokio::sync::watch;

#[derive(Debug)]
pub struct Scope {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    teardown_tx: watch::Sender<bool>,
    teardown_rx: watch::Receiver<bool>,
}

#[derive(Debug)]
struct State {
    active: usize,
    is_shutdown: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Scope {
    pub fn new() -> Scope {
        let (teardown_tx, teardown_rx) = watch::channel(false);
        Scope {
            inner: Arc::new(Inner {
                state: Mutex::new(State { active: 0, is_shutdown: false, waiters: Vec::new() }),
                teardown_tx,
                teardown_rx,
            }),
        }
    }

    /// Registers a new active task; `None` once shutdown has begun, so no
    /// new work starts while the scope is draining.
    pub fn try_guard(&self) -> Option<ActiveGuard> {
        let mut state = self.inner.state.lock().unwrap();
        if state.is_shutdown {
            return None;
        }
        state.active += 1;
        Some(ActiveGuard { inner: self.inner.clone() })
    }

    /// Begins teardown: new guards are refused and the signal wakes every
    /// subscribed task.
    pub fn shutdown(&self) {
        self.inner.state.lock().unwrap().is_shutdown = true;
        let _ = self.inner.teardown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().unwrap().is_shutdown
    }

    /// A receiver that resolves to `true` when teardown begins.
    pub fn teardown_signal(&self) -> watch::Receiver<bool> {
        self.inner.teardown_rx.clone()
    }

    /// Waits until no active guards remain.
    pub async fn drained(&self) {
        let receiver = {
            let mut state = self.inner.state.lock().unwrap();
            if state.active == 0 {
                None
            } else {
                let (sender, receiver) = oneshot::channel();
                state.waiters.push(sender);
                Some(receiver)
            }
        };
        if let Some(receiver) = receiver {
            let _ = receiver.await;
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

impl Clone for Scope {
    fn clone(&self) -> Self {
        Scope { inner: self.inner.clone() }
    }
}

/// Keeps the owning [`Scope`] from draining while held.
#[derive(Debug)]
pub struct ActiveGuard {
    inner: Arc<Inner>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        state.active -= 1;
        if state.active == 0 {
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drained_waits_for_guards() {
        let scope = Scope::new();
        let guard = scope.try_guard().unwrap();

        let waiter = {
            let scope = scope.clone();
            tokio::spawn(async move { scope.drained().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drained should resolve once the guard drops")
            .unwrap();
    }

    #[tokio::test]
    async fn no_guards_after_shutdown() {
        let scope = Scope::new();
        assert!(scope.try_guard().is_some());
        scope.shutdown();
        assert!(scope.try_guard().is_none());

        let mut signal = scope.teardown_signal();
        assert!(*signal.borrow_and_update());
    }

    #[tokio::test]
    async fn drained_immediate_when_idle() {
        let scope = Scope::new();
        scope.drained().await;
    }
}
