//! The status taxonomy shared by every operation in the framework.
//!
//! Every node operation and every wire reply carries a [`Status`].  Failures
//! are values, never panics: a failing request gets a status-bearing reply
//! and the connection stays open, unless the failure is a protocol violation
//! that tears the whole connection down.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Status>;

/// Fixed error taxonomy surfaced to clients.
///
/// Violations of internal invariants are not represented here.  Those are
/// programming errors and are asserted on, because they mean the dispatch
/// routing itself is broken, not that the client made a mistake.
#[derive(Error, Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    /// The operation has no meaning for this node kind.
    #[error("operation not supported")]
    NotSupported,
    /// Path or name lookup miss.
    #[error("not found")]
    NotFound,
    /// Create collision.
    #[error("already exists")]
    AlreadyExists,
    /// Rights or permission violation.
    #[error("access denied")]
    AccessDenied,
    /// Malformed flags, path, or name.
    #[error("invalid arguments")]
    InvalidArgs,
    /// A directory was required but the node is not one.
    #[error("not a directory")]
    NotDir,
    /// A file was required but the node is not one.
    #[error("not a file")]
    NotFile,
    /// The operation was attempted on a connection that cannot carry it,
    /// such as I/O on a node-reference handle.
    #[error("bad handle")]
    BadHandle,
    /// Allocation failure.
    #[error("no memory")]
    NoMemory,
    /// Oversized transfer or out-of-bounds offset arithmetic.
    #[error("out of range")]
    OutOfRange,
    /// The other end of the channel is gone.
    #[error("peer closed")]
    PeerClosed,
    /// Unclassified failure from an underlying layer.
    #[error("internal error")]
    Internal,
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Status {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Status::NotFound,
            ErrorKind::PermissionDenied => Status::AccessDenied,
            ErrorKind::AlreadyExists => Status::AlreadyExists,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Status::InvalidArgs,
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Status::PeerClosed
            }
            ErrorKind::OutOfMemory => Status::NoMemory,
            ErrorKind::UnexpectedEof => Status::OutOfRange,
            _ => Status::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_mapping() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Status::from(err), Status::NotFound);

        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer");
        assert_eq!(Status::from(err), Status::PeerClosed);
    }
}
