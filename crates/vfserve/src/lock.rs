//! Advisory file locking.
//!
//! Lock state lives in a process-wide side table keyed by node identity,
//! created lazily on the first lock request, so the common unlocked node
//! carries no per-node cost.  Locks are whole-file, shared or exclusive,
//! and purely cooperative.
//!
//! A blocking acquisition that conflicts parks the caller on a FIFO waiter
//! queue; the connection that issued it reads no further messages until the
//! lock is granted, which keeps per-connection reply ordering intact while
//! other connections keep running.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};

use futures::channel::oneshot;

use crate::error::{Result, Status};

/// Kind of advisory lock being requested.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    exclusive: bool,
    waiters: VecDeque<(LockKind, oneshot::Sender<()>)>,
}

impl LockState {
    fn grantable(&self, kind: LockKind) -> bool {
        match kind {
            LockKind::Shared => !self.exclusive,
            LockKind::Exclusive => !self.exclusive && self.shared == 0,
        }
    }

    fn grant(&mut self, kind: LockKind) {
        match kind {
            LockKind::Shared => self.shared += 1,
            LockKind::Exclusive => self.exclusive = true,
        }
    }

    fn release(&mut self, kind: LockKind) {
        match kind {
            LockKind::Shared => {
                assert!(self.shared > 0, "shared lock count underflow");
                self.shared -= 1;
            }
            LockKind::Exclusive => {
                assert!(self.exclusive, "exclusive lock released twice");
                self.exclusive = false;
            }
        }
    }

    /// Hands the lock to as many queued waiters as now fit, in order.
    fn wake_waiters(&mut self) {
        while let Some((kind, _)) = self.waiters.front() {
            if !self.grantable(*kind) {
                break;
            }
            let (kind, sender) = self.waiters.pop_front().unwrap();
            self.grant(kind);
            if sender.send(()).is_err() {
                // Waiter gave up (its connection died); undo and keep going.
                self.release(kind);
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    nodes: Mutex<HashMap<u64, Arc<Mutex<LockState>>>>,
}

static TABLE: LazyLock<LockTable> = LazyLock::new(LockTable::default);

pub(crate) fn table() -> &'static LockTable {
    &TABLE
}

/// Drops lock state for a node that no longer exists.
pub(crate) fn forget_node(id: u64) {
    table().nodes.lock().unwrap().remove(&id);
}

impl LockTable {
    fn state_for(&self, id: u64) -> Arc<Mutex<LockState>> {
        self.nodes.lock().unwrap().entry(id).or_default().clone()
    }

    /// Acquires a lock on the node with identity `id`.
    ///
    /// Non-blocking conflicts answer `AccessDenied`.  Blocking requests
    /// resolve when the lock is eventually granted; dropping the returned
    /// future abandons the wait safely.
    pub(crate) async fn acquire(&self, id: u64, kind: LockKind, blocking: bool) -> Result<()> {
        let receiver = {
            let state = self.state_for(id);
            let mut state = state.lock().unwrap();
            if state.grantable(kind) {
                state.grant(kind);
                return Ok(());
            }
            if !blocking {
                return Err(Status::AccessDenied);
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back((kind, sender));
            receiver
        };
        receiver.await.map_err(|_| Status::Internal)
    }

    /// Releases a previously granted lock and hands it to waiters.
    pub(crate) fn release(&self, id: u64, kind: LockKind) {
        let state = self.state_for(id);
        let mut state = state.lock().unwrap();
        state.release(kind);
        state.wake_waiters();
    }
}
