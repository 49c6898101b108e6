//! Live-node registry.
//!
//! Every node that enters a filesystem is recorded here by id, weakly, so
//! the filesystem's destructor can notify still-live nodes to drop their
//! back-references before the filesystem itself disappears.
//!
//! The registry has its own lock, never the namespace lock: nodes are
//! registered and dropped while the namespace lock is held, and a shared
//! lock would make that reentrant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::node::Vnode;

#[derive(Debug, Default)]
pub(crate) struct Registry {
    nodes: Mutex<HashMap<u64, Weak<dyn Vnode>>>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry { nodes: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn insert(&self, node: &Arc<dyn Vnode>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.core().id(), Arc::downgrade(node));
    }

    pub(crate) fn remove(&self, id: u64) {
        self.nodes.lock().unwrap().remove(&id);
    }

    /// Snapshot of the currently live nodes.
    pub(crate) fn live_nodes(&self) -> Vec<Arc<dyn Vnode>> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}
