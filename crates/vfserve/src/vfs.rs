//! The filesystem-wide coordinator.
//!
//! One [`Vfs`] owns the namespace lock that serializes path walks and
//! directory mutations, the live-node registry, the token registry used by
//! rename and link, the mount-point set, and the scope every connection
//! task runs in.
//!
//! The namespace lock and the registry/token/mount locks are deliberately
//! distinct: node registration and destruction happen while the namespace
//! lock is held, and sharing one lock would make those paths reentrant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};

use crate::connection;
use crate::error::{Result, Status};
use crate::node::{validate_options, OpenVnode, ValidatedOptions, Vnode};
use crate::path::{validate_name, VfsPath};
use crate::protocol::ProtocolSet;
use crate::registry::Registry;
use crate::remote::RemoteHandle;
use crate::rights::{OpenFlags, OpenOptions, Rights};
use crate::scope::Scope;
use crate::token::TokenRegistry;
use crate::transport::Channel;
use crate::watcher::{replay_existing, WatchEvent, WatchMask};
use crate::wire::{decode_dirents, CreateKind, MAX_DIRENTS_BYTES};

/// Outcome of a path walk: either a locally served node or a hand-off
/// across a remote mount.
pub enum OpenResult {
    /// The node is served by this filesystem.  The node is already open
    /// and the options are validated; dropping the handle performs the
    /// balancing close.
    Local { node: OpenVnode, options: ValidatedOptions },
    /// The walk hit a remote mount point partway; the caller forwards the
    /// remaining path across it.
    Remote { node: Arc<dyn Vnode>, path: String, options: OpenOptions },
    /// The walk resolved to a remote mount point itself; the caller
    /// forwards a root open across it.
    RemoteRoot { node: Arc<dyn Vnode>, options: OpenOptions },
}

pub struct Vfs {
    /// Serializes path walks, directory mutation, and readdir.
    namespace: tokio::sync::Mutex<()>,
    registry: Registry,
    tokens: TokenRegistry,
    mounts: Mutex<Vec<Weak<dyn Vnode>>>,
    scope: Scope,
    readonly: AtomicBool,
}

impl Vfs {
    pub fn new() -> Arc<Vfs> {
        Arc::new(Vfs {
            namespace: tokio::sync::Mutex::new(()),
            registry: Registry::new(),
            tokens: TokenRegistry::new(),
            mounts: Mutex::new(Vec::new()),
            scope: Scope::new(),
            readonly: AtomicBool::new(false),
        })
    }

    /// Marks the filesystem read-only: write rights and creation are
    /// refused from then on.
    pub fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::SeqCst);
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::SeqCst)
    }

    /// True once shutdown has begun; connections refuse new work.
    pub fn is_terminating(&self) -> bool {
        self.scope.is_shutdown()
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub(crate) fn tokens(&self) -> &TokenRegistry {
        &self.tokens
    }

    pub(crate) fn forget_node(&self, id: u64) {
        self.registry.remove(id);
    }

    /// Records a node as live in this filesystem and points its
    /// back-reference here.  Idempotent.
    pub fn register_node(self: &Arc<Self>, node: &Arc<dyn Vnode>) {
        node.core().attach_vfs(&Arc::downgrade(self));
        self.registry.insert(node);
    }

    /// Opens `path` relative to `root`, holding the namespace lock for the
    /// duration of the walk.
    ///
    /// `parent_rights` are the rights of the connection the open was issued
    /// over; they cap what the POSIX compatibility flags may add.
    pub async fn open(
        self: &Arc<Self>,
        root: Arc<dyn Vnode>,
        path: &str,
        mut flags: OpenFlags,
        mut rights: Rights,
        parent_rights: Rights,
    ) -> Result<OpenResult> {
        OpenOptions::new(flags, rights).validate()?;
        let parsed = VfsPath::parse(path)?;
        if parsed.must_be_dir() {
            if flags.contains(OpenFlags::NOT_DIRECTORY) {
                return Err(Status::InvalidArgs);
            }
            flags |= OpenFlags::DIRECTORY;
        }

        let _walk = self.namespace.lock().await;
        self.register_node(&root);

        let (node, created) = if parsed.is_dot() {
            (root, false)
        } else {
            match self.walk_to_target(root, &parsed, flags, rights).await? {
                Walked::Target(node, created) => (node, created),
                Walked::Remote(result) => return Ok(result),
            }
        };

        if node.is_remote() && !flags.contains(OpenFlags::NO_REMOTE) {
            return Ok(OpenResult::RemoteRoot {
                node,
                options: OpenOptions::new(flags, rights),
            });
        }

        if self.is_readonly() && rights.contains(Rights::WRITE) {
            return Err(Status::AccessDenied);
        }

        // POSIX compatibility: opening a directory may pick up write and
        // execute, but only when the parent connection already held them.
        if node.protocols().contains(ProtocolSet::DIRECTORY) {
            if flags.contains(OpenFlags::POSIX_WRITABLE) && parent_rights.contains(Rights::WRITE) {
                rights |= Rights::WRITE;
            }
            if flags.contains(OpenFlags::POSIX_EXECUTABLE)
                && parent_rights.contains(Rights::EXECUTE)
            {
                rights |= Rights::EXECUTE;
            }
        }
        flags.remove(OpenFlags::POSIX_WRITABLE | OpenFlags::POSIX_EXECUTABLE);

        let options = validate_options(&node, OpenOptions::new(flags, rights))?;

        let open = if options.is_node_reference() {
            OpenVnode::uncounted(node)
        } else if created {
            // A freshly created node is implicitly open.
            OpenVnode::adopt(node)
        } else {
            let open = OpenVnode::open(node, &options).await?;
            if open.is_remote() && !flags.contains(OpenFlags::NO_REMOTE) {
                // The open hook redirected to a mount point.
                let node = open.node().clone();
                drop(open);
                return Ok(OpenResult::RemoteRoot {
                    node,
                    options: OpenOptions::new(flags, rights),
                });
            }
            open
        };

        if flags.contains(OpenFlags::TRUNCATE) {
            // Dropping `open` on failure performs the compensating close,
            // so the open count never leaks.
            open.truncate(0).await?;
        }

        Ok(OpenResult::Local { node: open, options })
    }

    async fn walk_to_target(
        self: &Arc<Self>,
        root: Arc<dyn Vnode>,
        parsed: &VfsPath,
        flags: OpenFlags,
        rights: Rights,
    ) -> Result<Walked> {
        let components = parsed.components();
        let mut cur = root;

        for (index, name) in components[..components.len() - 1].iter().enumerate() {
            if cur.is_remote() {
                return Ok(Walked::Remote(OpenResult::Remote {
                    path: parsed.remainder(index),
                    options: OpenOptions::new(flags, rights),
                    node: cur,
                }));
            }
            cur = cur.clone().lookup(name).await?;
            self.register_node(&cur);
        }

        let last = components.last().expect("walk_to_target requires a non-dot path");
        if cur.is_remote() {
            return Ok(Walked::Remote(OpenResult::Remote {
                path: parsed.remainder(components.len() - 1),
                options: OpenOptions::new(flags, rights),
                node: cur,
            }));
        }

        if flags.contains(OpenFlags::CREATE) {
            if self.is_readonly() {
                return Err(Status::AccessDenied);
            }
            let kind = if flags.contains(OpenFlags::DIRECTORY) {
                CreateKind::Directory
            } else {
                CreateKind::File
            };
            let fail_if_exists = flags.contains(OpenFlags::FAIL_IF_EXISTS);
            let (node, created) = self.ensure_exists(&cur, last, kind, fail_if_exists).await?;
            self.register_node(&node);
            if created {
                if let Some(watchers) = cur.watchers() {
                    watchers.notify(WatchEvent::Added, last);
                }
            }
            Ok(Walked::Target(node, created))
        } else {
            let node = cur.clone().lookup(last).await?;
            self.register_node(&node);
            Ok(Walked::Target(node, false))
        }
    }

    /// Create-or-lookup for the final path component.
    ///
    /// A node that does not support creation makes `Create` answer
    /// `NotSupported`; that falls back to `Lookup` so opening existing
    /// entries on such filesystems still works.  Kept for compatibility
    /// with device-style filesystems; new node implementations should
    /// implement `create` rather than rely on this.
    async fn ensure_exists(
        &self,
        parent: &Arc<dyn Vnode>,
        name: &str,
        kind: CreateKind,
        fail_if_exists: bool,
    ) -> Result<(Arc<dyn Vnode>, bool)> {
        match parent.clone().create(name, kind).await {
            Ok(node) => Ok((node, true)),
            Err(Status::AlreadyExists) if !fail_if_exists => {
                Ok((parent.clone().lookup(name).await?, false))
            }
            Err(Status::NotSupported) => Ok((parent.clone().lookup(name).await?, false)),
            Err(status) => Err(status),
        }
    }

    /// Serves the outcome of [`Vfs::open`] onto `object`.
    pub async fn serve(self: &Arc<Self>, result: OpenResult, object: Channel) {
        match result {
            OpenResult::Local { node, options } => {
                connection::spawn(self.clone(), node, options, object).await;
            }
            OpenResult::Remote { node, path, options } => {
                if let Err(status) = node.open_remote(options, &path, object) {
                    warn!("failed to forward open across mount: {status}");
                }
            }
            OpenResult::RemoteRoot { node, options } => {
                if let Err(status) = node.open_remote(options, ".", object) {
                    warn!("failed to forward root open across mount: {status}");
                }
            }
        }
    }

    /// Opens the root of a tree and serves it on `object`.  This is the
    /// entry point a server uses to expose a filesystem.
    pub async fn serve_root(
        self: &Arc<Self>,
        root: Arc<dyn Vnode>,
        flags: OpenFlags,
        rights: Rights,
        object: Channel,
    ) -> Result<()> {
        match self.open(root, ".", flags, rights, rights).await {
            Ok(result) => {
                self.serve(result, object).await;
                Ok(())
            }
            Err(status) => {
                connection::send_on_open_error(&object, flags, status);
                Err(status)
            }
        }
    }

    /// Re-validates and serves an existing node for a clone request.
    pub(crate) async fn serve_clone(
        self: &Arc<Self>,
        node: Arc<dyn Vnode>,
        flags: OpenFlags,
        rights: Rights,
        object: Channel,
    ) {
        let options = match validate_options(&node, OpenOptions::new(flags, rights)) {
            Ok(options) => options,
            Err(status) => return connection::send_on_open_error(&object, flags, status),
        };
        let open = if options.is_node_reference() {
            OpenVnode::uncounted(node)
        } else {
            // Each clone opens the node again, so open accounting stays
            // per connection.
            match OpenVnode::open(node, &options).await {
                Ok(open) => open,
                Err(status) => return connection::send_on_open_error(&object, flags, status),
            }
        };
        connection::spawn(self.clone(), open, options, object).await;
    }

    /// Removes `name` from `parent` and notifies its watchers.
    pub async fn unlink(self: &Arc<Self>, parent: &Arc<dyn Vnode>, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.is_readonly() {
            return Err(Status::AccessDenied);
        }
        let _walk = self.namespace.lock().await;
        parent.clone().unlink(name).await?;
        if let Some(watchers) = parent.watchers() {
            watchers.notify(WatchEvent::Removed, name);
        }
        Ok(())
    }

    /// Moves `src` under the directory identified by `dst_token`, firing
    /// watcher notifications for both the removed and the added name.
    pub async fn rename(
        self: &Arc<Self>,
        src_dir: &Arc<dyn Vnode>,
        src: &str,
        dst_token: u64,
        dst: &str,
    ) -> Result<()> {
        validate_name(src)?;
        validate_name(dst)?;
        if self.is_readonly() {
            return Err(Status::AccessDenied);
        }
        let dst_dir = self.tokens.resolve(dst_token).ok_or(Status::BadHandle)?;

        let _walk = self.namespace.lock().await;
        src_dir.clone().rename(src, dst_dir.clone(), dst).await?;

        if let Some(watchers) = src_dir.watchers() {
            watchers.notify(WatchEvent::Removed, src);
        }
        if let Some(watchers) = dst_dir.watchers() {
            watchers.notify(WatchEvent::Added, dst);
        }
        Ok(())
    }

    /// Creates a second entry for `src` under the directory identified by
    /// `dst_token`.
    pub async fn link(
        self: &Arc<Self>,
        src_dir: &Arc<dyn Vnode>,
        src: &str,
        dst_token: u64,
        dst: &str,
    ) -> Result<()> {
        validate_name(src)?;
        validate_name(dst)?;
        if self.is_readonly() {
            return Err(Status::AccessDenied);
        }
        let dst_dir = self.tokens.resolve(dst_token).ok_or(Status::BadHandle)?;

        let _walk = self.namespace.lock().await;
        src_dir.clone().link(src, dst_dir.clone(), dst).await?;

        if let Some(watchers) = dst_dir.watchers() {
            watchers.notify(WatchEvent::Added, dst);
        }
        Ok(())
    }

    /// Reads directory entries under the namespace lock, so concurrent
    /// mutation cannot interleave with one readdir call.
    pub async fn readdir(
        self: &Arc<Self>,
        node: &Arc<dyn Vnode>,
        cookie: u64,
        max_bytes: u64,
    ) -> Result<(Vec<u8>, u64)> {
        if max_bytes > MAX_DIRENTS_BYTES {
            return Err(Status::OutOfRange);
        }
        let _walk = self.namespace.lock().await;
        node.read_dirents(cookie, max_bytes).await
    }

    /// Installs a watcher on a directory node, replaying current entries
    /// first when the mask asks for them.
    pub async fn watch_dir(
        self: &Arc<Self>,
        node: &Arc<dyn Vnode>,
        mask: WatchMask,
        watcher: Channel,
    ) -> Result<()> {
        if mask.is_empty() {
            return Err(Status::InvalidArgs);
        }
        let container = node.watchers().ok_or(Status::NotSupported)?;
        let sink = watcher.sender();

        // Replay and registration run under the namespace lock, so the
        // snapshot cannot miss or double-report a concurrent mutation.
        let _walk = self.namespace.lock().await;
        if mask.intersects(WatchMask::EXISTING | WatchMask::IDLE) {
            let mut names = Vec::new();
            let mut cookie = 0;
            loop {
                let (buf, next) = node.read_dirents(cookie, MAX_DIRENTS_BYTES).await?;
                if buf.is_empty() || next == cookie {
                    break;
                }
                for entry in decode_dirents(&buf)? {
                    names.push(entry.name);
                }
                cookie = next;
            }
            replay_existing(&sink, mask, names.iter().map(String::as_str))?;
        }
        container.register(mask, sink);
        Ok(())
    }

    /// Attaches a remote filesystem's root to `node` and records the mount.
    pub fn install_remote(
        self: &Arc<Self>,
        node: Arc<dyn Vnode>,
        remote: RemoteHandle,
    ) -> Result<()> {
        node.attach_remote(remote)?;
        self.mounts.lock().unwrap().push(Arc::downgrade(&node));
        info!("installed remote mount on node {}", node.core().id());
        Ok(())
    }

    /// Detaches the remote from `node`, sending the unmount signal.
    pub async fn uninstall_remote(self: &Arc<Self>, node: &Arc<dyn Vnode>) -> Result<()> {
        let id = node.core().id();
        self.mounts.lock().unwrap().retain(|weak| {
            weak.upgrade().is_some_and(|n| n.core().id() != id)
        });
        let remote = node.detach_remote().ok_or(Status::NotFound)?;
        remote.unmount().await;
        Ok(())
    }

    /// Detaches every remote mount, sending each the unmount signal.
    pub async fn uninstall_all(self: &Arc<Self>) {
        let mounts: Vec<_> = self.mounts.lock().unwrap().drain(..).collect();
        for weak in mounts {
            let Some(node) = weak.upgrade() else { continue };
            if let Some(remote) = node.detach_remote() {
                remote.unmount().await;
            }
        }
    }

    /// Shuts the filesystem down: refuses new connections, tells every
    /// remote mount it is being unmounted, wakes every connection task,
    /// and returns only after each one has finished tearing down and run
    /// its balancing close.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("vfs shutdown requested");
        self.scope.shutdown();
        self.uninstall_all().await;
        self.scope.drained().await;
        info!("vfs shutdown complete");
    }
}

enum Walked {
    Target(Arc<dyn Vnode>, bool),
    Remote(OpenResult),
}

impl std::fmt::Debug for OpenResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenResult::Local { node, options } => f
                .debug_struct("Local")
                .field("node", node)
                .field("options", options)
                .finish(),
            OpenResult::Remote { node, path, options } => f
                .debug_struct("Remote")
                .field("node", &node.core().id())
                .field("path", path)
                .field("options", options)
                .finish(),
            OpenResult::RemoteRoot { node, options } => f
                .debug_struct("RemoteRoot")
                .field("node", &node.core().id())
                .field("options", options)
                .finish(),
        }
    }
}

impl Drop for Vfs {
    fn drop(&mut self) {
        // Notify every still-live node before the filesystem disappears,
        // clearing back-references exactly once so no node is left with a
        // dangling owner pointer.
        for node in self.registry.live_nodes() {
            node.core().detach_vfs();
            node.will_destroy_vfs();
        }
    }
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("readonly", &self.is_readonly())
            .field("terminating", &self.is_terminating())
            .finish()
    }
}
