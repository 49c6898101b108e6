//! Vnode tokens for multi-path operations.
//!
//! Rename and link address their destination directory through a token the
//! client previously obtained over that directory's own connection, which
//! resolves in constant time without repeating a path walk.  A connection
//! is issued at most one token, on first request, and the token dies with
//! the connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::node::Vnode;

#[derive(Debug, Default)]
pub(crate) struct TokenRegistry {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next: u64,
    map: HashMap<u64, Weak<dyn Vnode>>,
}

impl TokenRegistry {
    pub(crate) fn new() -> TokenRegistry {
        TokenRegistry { inner: Mutex::new(Inner { next: 1, map: HashMap::new() }) }
    }

    /// Issues a fresh token for `node`.
    pub(crate) fn issue(&self, node: &Arc<dyn Vnode>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let token = inner.next;
        inner.next += 1;
        inner.map.insert(token, Arc::downgrade(node));
        token
    }

    /// Resolves a token to its node, if both are still alive.
    pub(crate) fn resolve(&self, token: u64) -> Option<Arc<dyn Vnode>> {
        self.inner.lock().unwrap().map.get(&token)?.upgrade()
    }

    /// Discards a token at connection teardown.
    pub(crate) fn discard(&self, token: u64) {
        self.inner.lock().unwrap().map.remove(&token);
    }
}
