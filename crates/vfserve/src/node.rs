//! The polymorphic filesystem node interface.
//!
//! A [`Vnode`] is one node in a served tree: a file, directory, device, or
//! service endpoint.  Implementations override the subset of operations
//! their node kind supports; everything else answers `NotSupported`.  The
//! framework calls into nodes through `Arc<dyn Vnode>` handles shared
//! between directories, open connections, and mount tracking.
//!
//! Open accounting is strict: every successful open is balanced by exactly
//! one close, including on paths where a follow-up step fails after the
//! open succeeded.  The [`OpenVnode`] guard enforces the balancing close.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::error::{Result, Status};
use crate::lock;
use crate::protocol::{acceptable_protocols, intersect, Protocol, ProtocolSet};
use crate::remote::RemoteHandle;
use crate::rights::{OpenFlags, OpenOptions, Rights};
use crate::transport::Channel;
use crate::vfs::Vfs;
use crate::watcher::WatcherContainer;
use crate::wire::{CreateKind, NodeAttributes, SetAttrMask};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Byte stream a file node may hand to its connection for direct I/O.
pub trait FileStream: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + AsyncSeek + Send + Unpin> FileStream for T {}

#[derive(Debug)]
enum VfsSlot {
    Unattached,
    Attached(Weak<Vfs>),
    /// The owning filesystem is gone; the back-reference was cleared once
    /// and stays cleared.
    Detached,
}

/// Per-node bookkeeping every [`Vnode`] implementation embeds.
///
/// Tracks the node's process-unique id, its open-connection count, and the
/// back-reference to the owning [`Vfs`].  A node can outlive its `Vfs`; the
/// back-reference is then cleared, not left dangling.
#[derive(Debug)]
pub struct NodeCore {
    id: u64,
    open_count: AtomicUsize,
    inflight: AtomicUsize,
    vfs: Mutex<VfsSlot>,
}

impl NodeCore {
    pub fn new() -> NodeCore {
        NodeCore {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            open_count: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            vfs: Mutex::new(VfsSlot::Unattached),
        }
    }

    /// Process-unique node id, usable as a directory entry ino.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of currently open connections to this node.
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Number of requests currently being dispatched against this node.
    pub fn inflight_transactions(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_transaction(&self) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_transaction(&self) {
        let prev = self.inflight.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "transaction count underflow");
    }

    /// The owning filesystem, while it is alive and attached.
    pub fn vfs(&self) -> Option<Arc<Vfs>> {
        match &*self.vfs.lock().unwrap() {
            VfsSlot::Attached(weak) => weak.upgrade(),
            _ => None,
        }
    }

    pub(crate) fn attach_vfs(&self, vfs: &Weak<Vfs>) {
        let mut slot = self.vfs.lock().unwrap();
        if matches!(*slot, VfsSlot::Unattached) {
            *slot = VfsSlot::Attached(vfs.clone());
        }
    }

    /// Clears the back-reference.  Called exactly once, from the owning
    /// filesystem's destructor.
    pub(crate) fn detach_vfs(&self) {
        *self.vfs.lock().unwrap() = VfsSlot::Detached;
    }

    fn begin_open(&self) {
        self.open_count.fetch_add(1, Ordering::SeqCst);
    }

    fn abort_open(&self) {
        let prev = self.open_count.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "open count underflow");
    }
}

impl Default for NodeCore {
    fn default() -> Self {
        NodeCore::new()
    }
}

impl Drop for NodeCore {
    fn drop(&mut self) {
        if let VfsSlot::Attached(weak) = &*self.vfs.get_mut().unwrap() {
            if let Some(vfs) = weak.upgrade() {
                vfs.forget_node(self.id);
            }
        }
        lock::forget_node(self.id);
    }
}

/// Proof that an open request was validated against a node.
///
/// Only the framework can construct one, so operations that require it
/// cannot be reached without passing validation first.
#[derive(Copy, Clone, Debug)]
pub struct ValidatedOptions {
    flags: OpenFlags,
    rights: Rights,
    protocol: Protocol,
}

impl ValidatedOptions {
    pub(crate) fn new(flags: OpenFlags, rights: Rights, protocol: Protocol) -> ValidatedOptions {
        ValidatedOptions { flags, rights, protocol }
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn rights(&self) -> Rights {
        self.rights
    }

    /// The protocol negotiated for the connection.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_node_reference(&self) -> bool {
        self.flags.contains(OpenFlags::NODE_REFERENCE)
    }
}

/// Validates an option set against a node and negotiates the connection
/// protocol.
///
/// Fails `NotDir`/`NotFile` when the requested and supported protocol sets
/// do not intersect, and `AccessDenied` when the node's rights predicate
/// rejects the requested rights.
pub fn validate_options(node: &Arc<dyn Vnode>, options: OpenOptions) -> Result<ValidatedOptions> {
    let candidates = intersect(acceptable_protocols(options.flags), node.protocols())?;
    let protocol = match candidates.first() {
        Some(only) if candidates.bits().count_ones() == 1 => only,
        _ => node.negotiate(candidates),
    };
    assert!(
        candidates.contains(protocol.into()),
        "negotiate picked a protocol outside the candidate set"
    );
    if !node.validate_rights(options.rights) {
        return Err(Status::AccessDenied);
    }
    Ok(ValidatedOptions::new(options.flags, options.rights, protocol))
}

/// An opened node handle that performs the balancing close when dropped.
pub struct OpenVnode {
    node: Arc<dyn Vnode>,
    counted: bool,
}

impl std::fmt::Debug for OpenVnode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenVnode")
            .field("node", &self.node.core().id())
            .field("counted", &self.counted)
            .finish()
    }
}

impl OpenVnode {
    /// Opens `node` with counted accounting.
    ///
    /// The open count is incremented before the node's `open` hook runs and
    /// rolled back if the hook fails.  When the hook redirects to another
    /// node, the count transfers to the redirect target and the target's own
    /// `open` hook is not re-invoked; the redirecting node hands the target
    /// back in an already usable state.
    pub async fn open(node: Arc<dyn Vnode>, options: &ValidatedOptions) -> Result<OpenVnode> {
        node.core().begin_open();
        match node.clone().open(options).await {
            Err(status) => {
                node.core().abort_open();
                Err(status)
            }
            Ok(None) => Ok(OpenVnode { node, counted: true }),
            Ok(Some(redirect)) => {
                assert!(
                    redirect.protocols().contains(options.protocol().into()),
                    "open redirect target does not support the negotiated protocol"
                );
                node.core().abort_open();
                redirect.core().begin_open();
                Ok(OpenVnode { node: redirect, counted: true })
            }
        }
    }

    /// Adopts a freshly created node, which is implicitly open: the count is
    /// taken without running the `open` hook, and the balancing close still
    /// happens on drop.
    pub fn adopt(node: Arc<dyn Vnode>) -> OpenVnode {
        node.core().begin_open();
        OpenVnode { node, counted: true }
    }

    /// Wraps a node for a node-reference connection: no open was performed,
    /// so no close will be either.
    pub fn uncounted(node: Arc<dyn Vnode>) -> OpenVnode {
        OpenVnode { node, counted: false }
    }

    pub fn node(&self) -> &Arc<dyn Vnode> {
        &self.node
    }
}

impl std::ops::Deref for OpenVnode {
    type Target = Arc<dyn Vnode>;

    fn deref(&self) -> &Self::Target {
        &self.node
    }
}

impl Drop for OpenVnode {
    fn drop(&mut self) {
        if self.counted {
            self.node.core().abort_open();
            if let Err(status) = self.node.clone().close() {
                debug!("close failed on node {}: {}", self.node.core().id(), status);
            }
        }
    }
}

/// One node in a served filesystem tree.
///
/// Most operations have defaults that answer `NotSupported`, so an
/// implementation only provides what its node kind can do.  All operations
/// report failures as [`Status`] values; none panic across this boundary.
#[async_trait]
pub trait Vnode: Send + Sync + 'static {
    /// The embedded bookkeeping record.
    fn core(&self) -> &NodeCore;

    /// Concrete-type escape hatch, used by directory implementations to
    /// recognize their own kind across rename and link.
    fn as_any(&self) -> &dyn Any;

    /// The protocols this node can speak.  Declarative and side-effect
    /// free.
    fn protocols(&self) -> ProtocolSet;

    /// Tie-break when protocol negotiation leaves several candidates.
    ///
    /// `candidates` is never empty.  The default picks the first candidate
    /// in declaration order.
    fn negotiate(&self, candidates: ProtocolSet) -> Protocol {
        candidates.first().expect("negotiate called with no candidates")
    }

    /// Whether a connection with `rights` may be opened to this node.
    fn validate_rights(&self, _rights: Rights) -> bool {
        true
    }

    /// Invoked once per successful open, after validation.
    ///
    /// May return a redirect node that all further I/O goes to instead;
    /// the redirect target must support the negotiated protocol.
    async fn open(self: Arc<Self>, _options: &ValidatedOptions) -> Result<Option<Arc<dyn Vnode>>> {
        Ok(None)
    }

    /// Balances a successful open.  Called exactly once per open, at
    /// connection teardown.
    fn close(self: Arc<Self>) -> Result<()> {
        Ok(())
    }

    /// Notification that the owning filesystem is being destroyed.  The
    /// framework has already cleared the back-reference when this runs.
    fn will_destroy_vfs(&self) {}

    async fn get_attrs(&self) -> Result<NodeAttributes> {
        Err(Status::NotSupported)
    }

    async fn set_attrs(&self, _valid: SetAttrMask, _attrs: NodeAttributes) -> Result<()> {
        Err(Status::NotSupported)
    }

    /// Reads up to `buf.len()` bytes at `offset`, reporting the actual
    /// count transferred.  Short reads are expressed through the count,
    /// never implicitly.
    async fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(Status::NotSupported)
    }

    /// Writes at `offset`, reporting the actual count transferred.
    async fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<usize> {
        Err(Status::NotSupported)
    }

    /// Appends, reporting the actual count and the resulting end offset.
    async fn append(&self, _data: &[u8]) -> Result<(usize, u64)> {
        Err(Status::NotSupported)
    }

    async fn truncate(&self, _length: u64) -> Result<()> {
        Err(Status::NotSupported)
    }

    async fn sync(&self) -> Result<()> {
        Err(Status::NotSupported)
    }

    /// A file node may hand out a byte stream once per connection; the
    /// connection then reads, writes, and seeks the stream directly.
    async fn create_stream(self: Arc<Self>) -> Result<Option<Box<dyn FileStream>>> {
        Ok(None)
    }

    async fn lookup(self: Arc<Self>, _name: &str) -> Result<Arc<dyn Vnode>> {
        Err(Status::NotSupported)
    }

    async fn create(self: Arc<Self>, _name: &str, _kind: CreateKind) -> Result<Arc<dyn Vnode>> {
        Err(Status::NotSupported)
    }

    async fn unlink(self: Arc<Self>, _name: &str) -> Result<()> {
        Err(Status::NotSupported)
    }

    async fn rename(
        self: Arc<Self>,
        _src: &str,
        _dst_dir: Arc<dyn Vnode>,
        _dst: &str,
    ) -> Result<()> {
        Err(Status::NotSupported)
    }

    async fn link(
        self: Arc<Self>,
        _src: &str,
        _dst_dir: Arc<dyn Vnode>,
        _dst: &str,
    ) -> Result<()> {
        Err(Status::NotSupported)
    }

    /// Encodes directory entries starting at `cookie` into a buffer of at
    /// most `max_bytes`, returning the buffer and the cookie to resume
    /// from.  The cookie is node-defined and round-tripped opaquely.
    async fn read_dirents(&self, _cookie: u64, _max_bytes: u64) -> Result<(Vec<u8>, u64)> {
        Err(Status::NotSupported)
    }

    /// The watcher registry for directory nodes that support watching.
    fn watchers(&self) -> Option<&WatcherContainer> {
        None
    }

    /// True when this node is a mount point forwarding to a remote
    /// filesystem.
    fn is_remote(&self) -> bool {
        false
    }

    fn attach_remote(&self, _remote: RemoteHandle) -> Result<()> {
        Err(Status::NotSupported)
    }

    fn detach_remote(&self) -> Option<RemoteHandle> {
        None
    }

    /// Forwards an open across the mount point to the remote root.
    fn open_remote(&self, _options: OpenOptions, _path: &str, _object: Channel) -> Result<()> {
        Err(Status::NotSupported)
    }

    /// Extension hook for node-defined request payloads.  `Ok(None)` means
    /// the node did not recognize the operation, which tears the
    /// connection down.
    async fn extension(self: Arc<Self>, _op: u32, _payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}
