#![forbid(unsafe_code)]
//! Asynchronous virtual-filesystem server framework.
//!
//! This crate is a tokio-based file-serving engine: it multiplexes many
//! concurrent client connections, each its own message channel, onto a tree
//! of polymorphic [`Vnode`] implementations.  The framework owns path
//! walking, protocol negotiation, rights enforcement, connection lifecycle,
//! directory watching, advisory locking, and remote mount hand-off; node
//! implementations own storage semantics and nothing else.
//!
//! # Overview
//!
//! To serve a filesystem you:
//!
//! 1. Implement [`Vnode`] for your node types (or start from
//!    [`test_utils`] for experiments).
//! 2. Create a [`Vfs`] and hand it the root node plus one end of a
//!    [`transport::channel`] via [`Vfs::serve_root`].
//! 3. Drive the other end from a client, directly or through
//!    [`client::Client`].
//!
//! # Example
//!
//! ```no_run
//! use vfserve::{client::Client, test_utils::TestDir, transport, OpenFlags, Rights, Vfs};
//!
//! #[tokio::main]
//! async fn main() -> vfserve::Result<()> {
//!     let vfs = Vfs::new();
//!     let root = TestDir::new();
//!
//!     let (server_end, client_end) = transport::channel();
//!     vfs.serve_root(root, OpenFlags::empty(), Rights::READ | Rights::WRITE, server_end)
//!         .await?;
//!
//!     let client = Client::new(client_end);
//!     let entries = client.readdir(8192).await?;
//!     println!("{} entries", entries.len());
//!
//!     vfs.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Connection model
//!
//! Every open produces one connection: one channel bound to one node under
//! one negotiated [`Protocol`].  Within a connection, replies are issued in
//! request order; the next message is not even read until the current
//! reply path has completed, so a slow operation pauses that connection
//! without blocking any other.  Across connections there is no ordering
//! guarantee.
//!
//! Rights are hierarchical: a connection opened or cloned through another
//! connection can never hold rights the original did not.  Path walks
//! reject `..` outright; there is no upward traversal at this layer.
//!
//! # Error handling
//!
//! Operations answer with a [`Status`] from a fixed taxonomy, surfaced to
//! clients as an explicit field of every reply.  A clean failure leaves
//! the connection open; only protocol violations tear it down.  Internal
//! invariant violations are asserts, not statuses.
//!
//! # Shutdown
//!
//! [`Vfs::shutdown`] refuses new work, notifies every remote mount that it
//! is being unmounted, wakes every connection task, and returns only after
//! each has run its balancing close on its node.

pub mod client;
pub(crate) mod connection;
pub mod error;
pub mod lock;
pub mod node;
pub mod path;
pub mod protocol;
pub(crate) mod registry;
pub mod remote;
pub mod rights;
pub mod scope;
pub mod test_utils;
pub(crate) mod token;
pub mod transport;
pub mod vfs;
pub mod watcher;
pub mod wire;

pub use crate::error::{Result, Status};
pub use crate::lock::LockKind;
pub use crate::node::{validate_options, FileStream, NodeCore, OpenVnode, ValidatedOptions, Vnode};
pub use crate::protocol::{Protocol, ProtocolSet};
pub use crate::rights::{
    check_child_open, inherit_rights_for_clone, OpenFlags, OpenOptions, Rights,
};
pub use crate::scope::{ActiveGuard, Scope};
pub use crate::vfs::{OpenResult, Vfs};
pub use crate::watcher::{WatchEvent, WatchMask};
pub use crate::wire::*;
