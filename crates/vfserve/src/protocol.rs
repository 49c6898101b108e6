//! Protocol tags and connection protocol negotiation.
//!
//! A node declares the protocols it can speak as a [`ProtocolSet`].  An open
//! request is translated into the set of protocols it would accept, the two
//! sets are intersected, and the surviving candidate becomes the
//! connection's protocol.  When more than one candidate survives, the node's
//! own [`negotiate`](crate::node::Vnode::negotiate) tie-break runs, and the
//! default tie-break picks the first candidate in declaration order, so the
//! outcome is deterministic for a given request and node.

use bitflags::bitflags;

use crate::error::{Result, Status};
use crate::rights::OpenFlags;

/// Operational contract a connection uses to talk to a node.
///
/// Declaration order is load bearing: it is the default negotiation
/// tie-break order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    /// Custom RPC service reached through extension requests.
    Connector,
    /// Byte-content file.
    File,
    /// Hierarchical directory.
    Directory,
    /// Device node.
    Device,
    /// Terminal device.
    Tty,
    /// Pipe endpoint.
    Pipe,
    /// Memory-backed file.
    Memory,
}

impl Protocol {
    const ORDER: [Protocol; 7] = [
        Protocol::Connector,
        Protocol::File,
        Protocol::Directory,
        Protocol::Device,
        Protocol::Tty,
        Protocol::Pipe,
        Protocol::Memory,
    ];

    fn bit(self) -> ProtocolSet {
        match self {
            Protocol::Connector => ProtocolSet::CONNECTOR,
            Protocol::File => ProtocolSet::FILE,
            Protocol::Directory => ProtocolSet::DIRECTORY,
            Protocol::Device => ProtocolSet::DEVICE,
            Protocol::Tty => ProtocolSet::TTY,
            Protocol::Pipe => ProtocolSet::PIPE,
            Protocol::Memory => ProtocolSet::MEMORY,
        }
    }
}

bitflags! {
    /// A set of [`Protocol`] tags.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct ProtocolSet: u32 {
        const CONNECTOR = 1 << 0;
        const FILE      = 1 << 1;
        const DIRECTORY = 1 << 2;
        const DEVICE    = 1 << 3;
        const TTY       = 1 << 4;
        const PIPE      = 1 << 5;
        const MEMORY    = 1 << 6;
    }
}

impl ProtocolSet {
    /// The first member in declaration order, if any.
    pub fn first(self) -> Option<Protocol> {
        Protocol::ORDER.iter().copied().find(|p| self.contains(p.bit()))
    }
}

impl From<Protocol> for ProtocolSet {
    fn from(p: Protocol) -> ProtocolSet {
        p.bit()
    }
}

/// The protocols an open request with these flags would accept.
pub fn acceptable_protocols(flags: OpenFlags) -> ProtocolSet {
    if flags.contains(OpenFlags::DIRECTORY) {
        ProtocolSet::DIRECTORY
    } else if flags.contains(OpenFlags::NOT_DIRECTORY) {
        ProtocolSet::all() - ProtocolSet::DIRECTORY
    } else {
        ProtocolSet::all()
    }
}

/// Intersects the acceptable and supported sets and reports a protocol
/// mismatch with the right error direction: asking for a directory from a
/// non-directory node is `NotDir`, everything else is `NotFile`.
pub fn intersect(acceptable: ProtocolSet, supported: ProtocolSet) -> Result<ProtocolSet> {
    let candidates = acceptable & supported;
    if candidates.is_empty() {
        if acceptable == ProtocolSet::DIRECTORY {
            Err(Status::NotDir)
        } else {
            Err(Status::NotFile)
        }
    } else {
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptable_set_from_flags() {
        assert_eq!(acceptable_protocols(OpenFlags::DIRECTORY), ProtocolSet::DIRECTORY);
        assert!(!acceptable_protocols(OpenFlags::NOT_DIRECTORY).contains(ProtocolSet::DIRECTORY));
        assert_eq!(acceptable_protocols(OpenFlags::empty()), ProtocolSet::all());
    }

    #[test]
    fn intersection_errors_point_the_right_way() {
        assert_eq!(
            intersect(ProtocolSet::DIRECTORY, ProtocolSet::FILE),
            Err(Status::NotDir)
        );
        assert_eq!(
            intersect(ProtocolSet::all() - ProtocolSet::DIRECTORY, ProtocolSet::DIRECTORY),
            Err(Status::NotFile)
        );
    }

    #[test]
    fn declaration_order_tie_break_is_stable() {
        let set = ProtocolSet::DEVICE | ProtocolSet::FILE | ProtocolSet::TTY;
        for _ in 0..16 {
            assert_eq!(set.first(), Some(Protocol::File));
        }
        assert_eq!(ProtocolSet::TTY.first(), Some(Protocol::Tty));
        assert_eq!(ProtocolSet::empty().first(), None);
    }
}
