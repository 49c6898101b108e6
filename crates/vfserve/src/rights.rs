//! Access rights and per-connection open options.
//!
//! A connection carries a set of [`Rights`] and a set of [`OpenFlags`] for
//! its whole lifetime (only `APPEND` can change later, through a set-flags
//! request).  Rights are hierarchical: a connection opened or cloned from
//! another connection can never hold rights the originating connection did
//! not hold.

use bitflags::bitflags;

use crate::error::{Result, Status};

bitflags! {
    /// Coarse-grained capability bits carried per connection.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Rights: u32 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const EXECUTE   = 1 << 2;
        const ADMIN     = 1 << 3;
    }
}

bitflags! {
    /// Flags describing how a node is being opened.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct OpenFlags: u32 {
        #[doc = "Create the final path component if it does not exist"]
        const CREATE            = 1 << 0;
        #[doc = "With CREATE, fail instead of opening an existing entry"]
        const FAIL_IF_EXISTS    = 1 << 1;
        #[doc = "Truncate file content to zero length after opening"]
        const TRUNCATE          = 1 << 2;
        #[doc = "The target must be a directory"]
        const DIRECTORY         = 1 << 3;
        #[doc = "The target must not be a directory"]
        const NOT_DIRECTORY     = 1 << 4;
        #[doc = "Writes go to the end of the file"]
        const APPEND            = 1 << 5;
        #[doc = "Attribute-only handle; no I/O, no Open call on the node"]
        const NODE_REFERENCE    = 1 << 6;
        #[doc = "Send an initial on-open event describing the node"]
        const DESCRIBE          = 1 << 7;
        #[doc = "Gain WRITE on directories when the parent connection has it"]
        const POSIX_WRITABLE    = 1 << 8;
        #[doc = "Gain EXECUTE on directories when the parent connection has it"]
        const POSIX_EXECUTABLE  = 1 << 9;
        #[doc = "Clone with exactly the originating connection's rights"]
        const CLONE_SAME_RIGHTS = 1 << 10;
        #[doc = "Refuse to cross a remote mount point at the final component"]
        const NO_REMOTE         = 1 << 11;
    }
}

/// The flag/rights pair derived from a client's open or clone request.
///
/// Immutable for the lifetime of a connection except `APPEND`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub flags: OpenFlags,
    pub rights: Rights,
}

impl OpenOptions {
    pub fn new(flags: OpenFlags, rights: Rights) -> Self {
        OpenOptions { flags, rights }
    }

    /// Validates the combination independent of any node.
    ///
    /// Runs before the path walk so that malformed requests never reach a
    /// node operation.
    pub fn validate(&self) -> Result<()> {
        let f = self.flags;
        if f.contains(OpenFlags::DIRECTORY | OpenFlags::NOT_DIRECTORY) {
            return Err(Status::InvalidArgs);
        }
        if f.contains(OpenFlags::FAIL_IF_EXISTS) && !f.contains(OpenFlags::CREATE) {
            return Err(Status::InvalidArgs);
        }
        // CLONE_SAME_RIGHTS only has meaning on a clone request.
        if f.contains(OpenFlags::CLONE_SAME_RIGHTS) {
            return Err(Status::InvalidArgs);
        }
        if f.contains(OpenFlags::TRUNCATE) && !self.rights.contains(Rights::WRITE) {
            return Err(Status::InvalidArgs);
        }
        // A connection must carry at least one right unless it is an
        // attribute-only handle.
        if self.rights.is_empty() && !f.contains(OpenFlags::NODE_REFERENCE) {
            return Err(Status::InvalidArgs);
        }
        Ok(())
    }

    pub fn is_node_reference(&self) -> bool {
        self.flags.contains(OpenFlags::NODE_REFERENCE)
    }
}

/// Checks a child open issued over a directory connection against the
/// parent connection, so that child connections never receive more rights
/// than the parent holds.
///
/// The POSIX compatibility flags are dropped (not rejected) when the parent
/// lacks the corresponding right.
pub fn check_child_open(
    parent_rights: Rights,
    mut flags: OpenFlags,
    rights: Rights,
) -> Result<(OpenFlags, Rights)> {
    if flags.contains(OpenFlags::CLONE_SAME_RIGHTS) {
        return Err(Status::InvalidArgs);
    }
    if flags.contains(OpenFlags::DIRECTORY | OpenFlags::NOT_DIRECTORY) {
        return Err(Status::InvalidArgs);
    }
    if flags.contains(OpenFlags::FAIL_IF_EXISTS) && !flags.contains(OpenFlags::CREATE) {
        return Err(Status::InvalidArgs);
    }

    if !parent_rights.contains(Rights::WRITE) {
        flags.remove(OpenFlags::POSIX_WRITABLE);
    }
    if !parent_rights.contains(Rights::EXECUTE) {
        flags.remove(OpenFlags::POSIX_EXECUTABLE);
    }

    if flags.contains(OpenFlags::CREATE) && !parent_rights.contains(Rights::WRITE) {
        return Err(Status::AccessDenied);
    }

    if !parent_rights.contains(rights) {
        return Err(Status::AccessDenied);
    }
    Ok((flags, rights))
}

/// Computes the flags and rights of a cloned connection.
///
/// `CLONE_SAME_RIGHTS` is exclusive with explicitly requested rights.  The
/// originating connection's `APPEND` and `NODE_REFERENCE` flags always carry
/// over, whatever the request said.
pub fn inherit_rights_for_clone(
    parent_flags: OpenFlags,
    parent_rights: Rights,
    mut flags: OpenFlags,
    rights: Rights,
) -> Result<(OpenFlags, Rights)> {
    let same_rights = flags.contains(OpenFlags::CLONE_SAME_RIGHTS);
    if same_rights && !rights.is_empty() {
        return Err(Status::InvalidArgs);
    }

    flags.remove(OpenFlags::CLONE_SAME_RIGHTS);
    flags |= parent_flags & (OpenFlags::APPEND | OpenFlags::NODE_REFERENCE);

    let rights = if same_rights {
        parent_rights
    } else {
        if !parent_rights.contains(rights) {
            return Err(Status::AccessDenied);
        }
        rights
    };
    Ok((flags, rights))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(flags: OpenFlags, rights: Rights) -> OpenOptions {
        OpenOptions::new(flags, rights)
    }

    #[test]
    fn validate_conflicting_directory_flags() {
        let o = opts(OpenFlags::DIRECTORY | OpenFlags::NOT_DIRECTORY, Rights::READ);
        assert_eq!(o.validate(), Err(Status::InvalidArgs));
    }

    #[test]
    fn validate_fail_if_exists_requires_create() {
        let o = opts(OpenFlags::FAIL_IF_EXISTS, Rights::READ);
        assert_eq!(o.validate(), Err(Status::InvalidArgs));
        let o = opts(OpenFlags::CREATE | OpenFlags::FAIL_IF_EXISTS, Rights::READ | Rights::WRITE);
        assert_eq!(o.validate(), Ok(()));
    }

    #[test]
    fn validate_truncate_requires_write() {
        let o = opts(OpenFlags::TRUNCATE, Rights::READ);
        assert_eq!(o.validate(), Err(Status::InvalidArgs));
        let o = opts(OpenFlags::TRUNCATE, Rights::READ | Rights::WRITE);
        assert_eq!(o.validate(), Ok(()));
    }

    #[test]
    fn validate_same_rights_rejected_on_open() {
        let o = opts(OpenFlags::CLONE_SAME_RIGHTS, Rights::READ);
        assert_eq!(o.validate(), Err(Status::InvalidArgs));
    }

    #[test]
    fn validate_empty_rights_only_for_node_reference() {
        let o = opts(OpenFlags::empty(), Rights::empty());
        assert_eq!(o.validate(), Err(Status::InvalidArgs));
        let o = opts(OpenFlags::NODE_REFERENCE, Rights::empty());
        assert_eq!(o.validate(), Ok(()));
    }

    #[test]
    fn child_open_posix_flags_soft_dropped() {
        let (flags, _) = check_child_open(
            Rights::READ,
            OpenFlags::POSIX_WRITABLE | OpenFlags::POSIX_EXECUTABLE,
            Rights::READ,
        )
        .unwrap();
        assert_eq!(flags, OpenFlags::empty());

        let (flags, _) = check_child_open(
            Rights::READ | Rights::WRITE,
            OpenFlags::POSIX_WRITABLE | OpenFlags::POSIX_EXECUTABLE,
            Rights::READ,
        )
        .unwrap();
        assert_eq!(flags, OpenFlags::POSIX_WRITABLE);
    }

    #[test]
    fn child_open_create_requires_writable_parent() {
        assert_eq!(
            check_child_open(Rights::READ, OpenFlags::CREATE, Rights::READ),
            Err(Status::AccessDenied)
        );
        assert!(
            check_child_open(Rights::READ | Rights::WRITE, OpenFlags::CREATE, Rights::READ)
                .is_ok()
        );
    }

    #[test]
    fn child_open_rights_never_widen() {
        assert_eq!(
            check_child_open(Rights::READ, OpenFlags::empty(), Rights::READ | Rights::WRITE),
            Err(Status::AccessDenied)
        );
    }

    #[test]
    fn clone_same_rights_exclusive_with_explicit_rights() {
        assert_eq!(
            inherit_rights_for_clone(
                OpenFlags::empty(),
                Rights::READ,
                OpenFlags::CLONE_SAME_RIGHTS,
                Rights::READ,
            ),
            Err(Status::InvalidArgs)
        );
    }

    #[test]
    fn clone_same_rights_inherits_exactly() {
        let (_, rights) = inherit_rights_for_clone(
            OpenFlags::empty(),
            Rights::READ | Rights::WRITE,
            OpenFlags::CLONE_SAME_RIGHTS,
            Rights::empty(),
        )
        .unwrap();
        assert_eq!(rights, Rights::READ | Rights::WRITE);
    }

    #[test]
    fn clone_rights_must_be_subset() {
        assert_eq!(
            inherit_rights_for_clone(
                OpenFlags::empty(),
                Rights::READ,
                OpenFlags::empty(),
                Rights::READ | Rights::WRITE,
            ),
            Err(Status::AccessDenied)
        );
    }

    #[test]
    fn clone_preserves_append_and_node_reference() {
        let (flags, _) = inherit_rights_for_clone(
            OpenFlags::APPEND | OpenFlags::NODE_REFERENCE,
            Rights::READ,
            OpenFlags::empty(),
            Rights::READ,
        )
        .unwrap();
        assert!(flags.contains(OpenFlags::APPEND | OpenFlags::NODE_REFERENCE));
    }
}
