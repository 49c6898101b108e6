//! An example in-memory filesystem built on top of the vfserve library.
//!
//! Provides mutable directories and vector-backed files, plus the classic
//! null and zero device nodes, all as [`vfserve::Vnode`] implementations.
//! The binary wraps these in a small interactive shell; the integration
//! tests drive them through real connections.

pub mod dev;
pub mod fs;

pub use dev::{NullDevice, ZeroDevice};
pub use fs::{MemDir, MemFile};

use std::sync::Arc;

/// Builds the demo tree: an empty `tmp/`, plus `dev/null` and `dev/zero`.
pub fn demo_root() -> Arc<MemDir> {
    let root = MemDir::new();
    let dev = MemDir::new();
    dev.insert("null", NullDevice::new());
    dev.insert("zero", ZeroDevice::new());
    root.insert("dev", dev);
    root.insert("tmp", MemDir::new());
    root
}
