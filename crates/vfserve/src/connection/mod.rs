//! Per-channel connection state machines.
//!
//! A connection couples one client channel to one open node under one
//! negotiated protocol.  The dispatch loop reads one message at a time and
//! does not read the next until the current reply has been sent or has
//! durably failed, so replies on a channel always come back in request
//! order.  Slow operations simply keep the loop awaiting; other
//! connections keep running.
//!
//! Dispatch tries the protocol-specific table first, then the operations
//! common to every protocol, then hands unknown extension payloads to the
//! node itself; a message nobody recognizes tears the connection down.
//! Teardown, however reached, releases the connection's token and advisory
//! lock and performs exactly one balancing close on the node.

mod binding;
mod directory;
mod file;
mod node;

use std::sync::Arc;

use async_trait::async_trait;
use log::{trace, warn};

use crate::error::{Result, Status};
use crate::lock::{self, LockKind};
use crate::node::{OpenVnode, ValidatedOptions};
use crate::protocol::Protocol;
use crate::rights::{inherit_rights_for_clone, OpenFlags, Rights};
use crate::scope::ActiveGuard;
use crate::transport::Channel;
use crate::vfs::Vfs;
use crate::wire::{Event, Message, NodeInfo, Payload, Request, Response};

pub(crate) use binding::{Binding, PumpEvent, Responder};
pub(crate) use directory::DirectoryConnection;
pub(crate) use file::FileConnection;
pub(crate) use node::NodeConnection;

/// Outcome of handling one request.
pub(crate) enum ConnectionState {
    Alive,
    Closed,
}

/// Sends the failed on-open event the describe contract requires: a caller
/// that asked to be told the outcome is told, even when the open failed and
/// the channel is about to go away.
pub(crate) fn send_on_open_error(object: &Channel, flags: OpenFlags, status: Status) {
    if flags.contains(OpenFlags::DESCRIBE) {
        let _ = object.send(Message::event(Event::OnOpen {
            status: Err(status),
            info: None,
        }));
    }
}

/// Builds the error reply matching a request, or `None` for pipelined
/// requests that have no reply.
pub(crate) fn error_response(req: &Request, status: Status) -> Option<Response> {
    Some(match req {
        Request::Open { .. } | Request::Clone { .. } => return None,
        Request::Close => Response::Close(Err(status)),
        Request::Describe => Response::Describe(Err(status)),
        Request::Sync => Response::Sync(Err(status)),
        Request::GetAttrs => Response::GetAttrs(Err(status)),
        Request::SetAttrs { .. } => Response::SetAttrs(Err(status)),
        Request::GetFlags => Response::GetFlags(Err(status)),
        Request::SetFlags { .. } => Response::SetFlags(Err(status)),
        Request::Lock { .. } => Response::Lock(Err(status)),
        Request::Unlock => Response::Unlock(Err(status)),
        Request::Extension { .. } => Response::Extension(Err(status)),
        Request::Unlink { .. } => Response::Unlink(Err(status)),
        Request::ReadDir { .. } => Response::ReadDir(Err(status)),
        Request::Rewind => Response::Rewind(Err(status)),
        Request::GetToken => Response::GetToken(Err(status)),
        Request::Rename { .. } => Response::Rename(Err(status)),
        Request::Link { .. } => Response::Link(Err(status)),
        Request::Watch { .. } => Response::Watch(Err(status)),
        Request::Mount { .. } => Response::Mount(Err(status)),
        Request::Unmount => Response::Unmount(Err(status)),
        Request::Read { .. } | Request::ReadAt { .. } => Response::Read(Err(status)),
        Request::Write { .. } | Request::WriteAt { .. } => Response::Write(Err(status)),
        Request::Seek { .. } => Response::Seek(Err(status)),
        Request::Truncate { .. } => Response::Truncate(Err(status)),
    })
}

/// State shared by every connection kind.
pub(crate) struct Common {
    pub(crate) vfs: Arc<Vfs>,
    pub(crate) node: OpenVnode,
    pub(crate) flags: OpenFlags,
    pub(crate) rights: Rights,
    pub(crate) protocol: Protocol,
    binding: Binding,
    token: Option<u64>,
    lock_held: Option<LockKind>,
}

impl Common {
    fn info(&self) -> NodeInfo {
        NodeInfo::for_protocol(self.protocol, self.flags)
    }

    fn is_node_reference(&self) -> bool {
        self.flags.contains(OpenFlags::NODE_REFERENCE)
    }

    /// Handles the operations every protocol shares.  Anything left over
    /// is an operation this connection cannot carry: it gets `BadHandle`,
    /// except extension payloads the node itself does not recognize, which
    /// are terminal.
    pub(crate) async fn handle_common(
        &mut self,
        req: Request,
        responder: Responder,
    ) -> Result<ConnectionState> {
        match req {
            Request::Clone { flags, rights, object } => {
                self.handle_clone(flags, rights, object).await;
            }
            Request::Close => {
                responder.send(Response::Close(Ok(())));
                return Ok(ConnectionState::Closed);
            }
            Request::Describe => {
                responder.send(Response::Describe(Ok(self.info())));
            }
            Request::GetFlags => {
                responder.send(Response::GetFlags(Ok(self.flags)));
            }
            Request::GetAttrs => {
                responder.send(Response::GetAttrs(self.node.get_attrs().await));
            }
            Request::SetFlags { flags } if !self.is_node_reference() => {
                // Only the append behavior may change after open.
                self.flags.remove(OpenFlags::APPEND);
                self.flags |= flags & OpenFlags::APPEND;
                responder.send(Response::SetFlags(Ok(())));
            }
            Request::SetAttrs { valid, attrs } if !self.is_node_reference() => {
                let result = if self.rights.contains(Rights::WRITE) {
                    self.node.set_attrs(valid, attrs).await
                } else {
                    Err(Status::AccessDenied)
                };
                responder.send(Response::SetAttrs(result));
            }
            Request::Sync if !self.is_node_reference() => {
                responder.send(Response::Sync(self.node.sync().await));
            }
            Request::Lock { kind, blocking } if !self.is_node_reference() => {
                let result = self.acquire_lock(kind, blocking).await;
                responder.send(Response::Lock(result));
            }
            Request::Unlock if !self.is_node_reference() => {
                let result = match self.lock_held.take() {
                    Some(kind) => {
                        lock::table().release(self.node.core().id(), kind);
                        Ok(())
                    }
                    None => Err(Status::InvalidArgs),
                };
                responder.send(Response::Unlock(result));
            }
            Request::Extension { op, payload } if !self.is_node_reference() => {
                match self.node.node().clone().extension(op, payload).await {
                    Ok(Some(reply)) => responder.send(Response::Extension(Ok(reply))),
                    Ok(None) => {
                        // Neither the protocol nor the node recognizes the
                        // message; tear the connection down.
                        return Err(Status::NotSupported);
                    }
                    Err(status) => responder.send(Response::Extension(Err(status))),
                }
            }
            // Recognized operation, wrong kind of connection.
            Request::Open { flags, object, .. } => {
                send_on_open_error(&object, flags, Status::BadHandle);
            }
            other => {
                if let Some(resp) = error_response(&other, Status::BadHandle) {
                    responder.send(resp);
                }
            }
        }
        Ok(ConnectionState::Alive)
    }

    /// Serves a clone of this connection onto `object`.
    ///
    /// Re-validates against the node and opens it again, so every clone
    /// carries its own open/close balance.
    async fn handle_clone(&mut self, flags: OpenFlags, rights: Rights, object: Channel) {
        match inherit_rights_for_clone(self.flags, self.rights, flags, rights) {
            Err(status) => send_on_open_error(&object, flags, status),
            Ok((flags, rights)) => {
                let node = self.node.node().clone();
                self.vfs.serve_clone(node, flags, rights, object).await;
            }
        }
    }

    async fn acquire_lock(&mut self, kind: LockKind, blocking: bool) -> Result<()> {
        let id = self.node.core().id();
        if self.lock_held == Some(kind) {
            return Ok(());
        }
        // Converting between kinds releases first; the conversion may then
        // wait like any fresh acquisition.
        if let Some(held) = self.lock_held.take() {
            lock::table().release(id, held);
        }
        let acquire = lock::table().acquire(id, kind, blocking);
        tokio::pin!(acquire);
        tokio::select! {
            result = &mut acquire => {
                result?;
                self.lock_held = Some(kind);
                Ok(())
            }
            _ = self.binding.torn_down() => Err(Status::PeerClosed),
        }
    }

    /// Releases per-connection resources at teardown.  The balancing close
    /// itself runs when the `OpenVnode` drops with the connection.
    fn cleanup(&mut self) {
        if let Some(token) = self.token.take() {
            self.vfs.tokens().discard(token);
        }
        if let Some(kind) = self.lock_held.take() {
            lock::table().release(self.node.core().id(), kind);
        }
    }
}

/// Connection kinds plug their protocol method table in here.
#[async_trait]
pub(crate) trait RequestHandler: Send {
    fn common(&mut self) -> &mut Common;

    async fn handle_request(
        &mut self,
        req: Request,
        responder: Responder,
    ) -> Result<ConnectionState>;
}

/// Constructs the connection matching the negotiated protocol and starts
/// its dispatch task.  Sends the initial on-open event when requested.
pub(crate) async fn spawn(
    vfs: Arc<Vfs>,
    node: OpenVnode,
    options: ValidatedOptions,
    object: Channel,
) {
    let Some(guard) = vfs.scope().try_guard() else {
        // Shutting down; treat the open as if the peer had disconnected.
        send_on_open_error(&object, options.flags(), Status::PeerClosed);
        return;
    };

    let is_file = !options.is_node_reference()
        && matches!(options.protocol(), Protocol::File | Protocol::Memory);
    let stream = if is_file {
        match node.node().clone().create_stream().await {
            Ok(stream) => stream,
            Err(status) => {
                send_on_open_error(&object, options.flags(), status);
                return;
            }
        }
    } else {
        None
    };

    if options.flags().contains(OpenFlags::DESCRIBE) {
        let info = NodeInfo::for_protocol(options.protocol(), options.flags());
        let _ = object.send(Message::event(Event::OnOpen { status: Ok(()), info: Some(info) }));
    }

    let common = Common {
        binding: Binding::new(object, vfs.scope().teardown_signal()),
        vfs,
        node,
        flags: options.flags(),
        rights: options.rights(),
        protocol: options.protocol(),
        token: None,
        lock_held: None,
    };

    if options.is_node_reference() {
        tokio::spawn(run(NodeConnection::new(common), guard));
        return;
    }
    match options.protocol() {
        Protocol::Directory => {
            tokio::spawn(run(DirectoryConnection::new(common), guard));
        }
        Protocol::File | Protocol::Memory => {
            tokio::spawn(run(FileConnection::new(common, stream), guard));
        }
        _ => {
            tokio::spawn(run(NodeConnection::new(common), guard));
        }
    }
}

/// The dispatch loop: one message at a time, in order, until the peer
/// disconnects, a close request arrives, or the filesystem tears the
/// connection down.
pub(crate) async fn run<H: RequestHandler>(mut handler: H, guard: ActiveGuard) {
    loop {
        if handler.common().vfs.is_terminating() {
            break;
        }
        let msg = match handler.common().binding.next_event().await {
            PumpEvent::Message(msg) => msg,
            PumpEvent::PeerClosed | PumpEvent::Teardown => break,
        };

        let (txid, req) = match msg {
            Message { txid, body: Payload::Request(req) } => (txid, req),
            other => {
                warn!("non-request message on a server channel: {other:?}");
                break;
            }
        };

        trace!("← {}", req.method());
        let responder = handler.common().binding.responder(txid);
        handler.common().node.core().begin_transaction();
        let outcome = handler.handle_request(req, responder).await;
        handler.common().node.core().end_transaction();
        match outcome {
            Ok(ConnectionState::Alive) => {}
            Ok(ConnectionState::Closed) => break,
            Err(status) => {
                warn!("tearing down connection: {status}");
                break;
            }
        }
    }

    handler.common().cleanup();
    // Dropping the handler drops its OpenVnode, which performs the
    // balancing close; only then may the scope observe us as drained.
    drop(handler);
    drop(guard);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::client::Client;
    use crate::error::{Result, Status};
    use crate::lock::LockKind;
    use crate::node::{NodeCore, Vnode};
    use crate::protocol::ProtocolSet;
    use crate::rights::{OpenFlags, Rights};
    use crate::test_utils::{TestDir, TestFile};
    use crate::transport::channel;
    use crate::vfs::Vfs;
    use crate::watcher::{decode_watch_events, WatchEvent, WatchMask};
    use crate::wire::{Event, NodeInfo, Payload, SeekOrigin};

    fn rw() -> Rights {
        Rights::READ | Rights::WRITE
    }

    async fn serve(vfs: &Arc<Vfs>, root: Arc<dyn Vnode>, rights: Rights) -> Client {
        let (server_end, client_end) = channel();
        vfs.serve_root(root, OpenFlags::empty(), rights, server_end)
            .await
            .expect("serving the root should succeed");
        Client::new(client_end)
    }

    #[tokio::test]
    async fn file_read_write_seek_round_trip() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        root.add("f", TestFile::new(b"hello world"));
        let dir = serve(&vfs, root, rw()).await;

        let file = dir.open(OpenFlags::empty(), rw(), "f").unwrap();
        assert_eq!(file.read(5).await.unwrap(), b"hello");
        assert_eq!(file.seek(SeekOrigin::Current, 1).await.unwrap(), 6);
        assert_eq!(file.read(5).await.unwrap(), b"world");

        file.seek(SeekOrigin::Start, 0).await.unwrap();
        assert_eq!(file.write(b"HELLO").await.unwrap(), 5);
        assert_eq!(file.read_at(0, 11).await.unwrap(), b"HELLO world");

        // End-origin arithmetic, and underflow rejection.
        assert_eq!(file.seek(SeekOrigin::End, -5).await.unwrap(), 6);
        assert_eq!(file.seek(SeekOrigin::Start, 0).await.unwrap(), 0);
        assert_eq!(file.seek(SeekOrigin::Current, -1).await.unwrap_err(), Status::OutOfRange);

        file.close().await.unwrap();
        vfs.shutdown().await;
    }

    #[tokio::test]
    async fn append_flag_can_be_toggled_by_set_flags() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        let file_node = TestFile::new(b"ab");
        root.add("f", file_node.clone());
        let dir = serve(&vfs, root, rw()).await;

        let file = dir.open(OpenFlags::empty(), rw(), "f").unwrap();
        file.set_flags(OpenFlags::APPEND).await.unwrap();
        file.write(b"cd").await.unwrap();
        assert_eq!(file_node.content(), b"abcd");
        assert!(file.get_flags().await.unwrap().contains(OpenFlags::APPEND));

        vfs.shutdown().await;
    }

    #[tokio::test]
    async fn clone_cannot_widen_rights() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        root.add("f", TestFile::new(b"x"));
        let dir = serve(&vfs, root, rw()).await;
        let file = dir.open(OpenFlags::empty(), Rights::READ, "f").unwrap();

        let widened = file.clone_conn(OpenFlags::DESCRIBE, rw()).unwrap();
        let (status, info) = widened.expect_on_open().await.unwrap();
        assert_eq!(status, Err(Status::AccessDenied));
        assert!(info.is_none());

        let same = file.clone_conn(OpenFlags::CLONE_SAME_RIGHTS, Rights::empty()).unwrap();
        assert_eq!(same.read_at(0, 1).await.unwrap(), b"x");

        vfs.shutdown().await;
    }

    #[tokio::test]
    async fn clone_balances_open_counts_per_connection() {
        let vfs = Vfs::new();
        let file_node = TestFile::new(b"x");
        let root = TestDir::new();
        root.add("f", file_node.clone());
        let dir = serve(&vfs, root, rw()).await;

        let file = dir.open(OpenFlags::empty(), Rights::READ, "f").unwrap();
        file.get_attrs().await.unwrap();
        assert_eq!(file_node.core().open_count(), 1);

        let second = file.clone_conn(OpenFlags::CLONE_SAME_RIGHTS, Rights::empty()).unwrap();
        second.get_attrs().await.unwrap();
        assert_eq!(file_node.core().open_count(), 2);

        second.close().await.unwrap();
        file.close().await.unwrap();
        vfs.shutdown().await;
        assert_eq!(file_node.core().open_count(), 0);
    }

    #[tokio::test]
    async fn node_reference_connection_rejects_io() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        root.add("f", TestFile::new(b"data"));
        let dir = serve(&vfs, root, rw()).await;

        let flags = OpenFlags::NODE_REFERENCE | OpenFlags::DESCRIBE;
        let node = dir.open(flags, Rights::empty(), "f").unwrap();
        let (status, info) = node.expect_on_open().await.unwrap();
        assert_eq!(status, Ok(()));
        assert_eq!(info, Some(NodeInfo::Node));

        assert_eq!(node.read(4).await.unwrap_err(), Status::BadHandle);
        assert_eq!(node.sync().await.unwrap_err(), Status::BadHandle);
        assert!(node.get_attrs().await.is_ok());

        vfs.shutdown().await;
    }

    #[tokio::test]
    async fn failed_open_still_sends_describe_event() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        let dir = serve(&vfs, root, rw()).await;

        let missing = dir.open(OpenFlags::DESCRIBE, Rights::READ, "absent").unwrap();
        let (status, info) = missing.expect_on_open().await.unwrap();
        assert_eq!(status, Err(Status::NotFound));
        assert!(info.is_none());

        vfs.shutdown().await;
    }

    #[tokio::test]
    async fn readdir_cookie_and_rewind() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        root.add("a", TestFile::new(b""));
        root.add("b", TestFile::new(b""));
        root.add("c", TestDir::new());
        let dir = serve(&vfs, root, rw()).await;

        let all: Vec<String> = dir
            .readdir(8192)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(all, ["a", "b", "c"]);

        // Exhausted iteration yields an empty buffer until rewound.
        assert!(dir.readdir(8192).await.unwrap().is_empty());
        dir.rewind().await.unwrap();
        assert_eq!(dir.readdir(8192).await.unwrap().len(), 3);

        assert_eq!(dir.readdir(1 << 20).await.unwrap_err(), Status::OutOfRange);

        vfs.shutdown().await;
    }

    #[tokio::test]
    async fn unlink_requires_a_writable_connection() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        root.add("f", TestFile::new(b""));

        let reader = serve(&vfs, root.clone(), Rights::READ).await;
        assert_eq!(reader.unlink("f").await.unwrap_err(), Status::AccessDenied);

        let writer = serve(&vfs, root.clone(), rw()).await;
        writer.unlink("f").await.unwrap();
        assert!(!root.has_entry("f"));

        vfs.shutdown().await;
    }

    #[tokio::test]
    async fn rename_through_token_end_to_end() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        let sub = TestDir::new();
        root.add("src", TestFile::new(b"payload"));
        root.add("sub", sub.clone());
        let dir = serve(&vfs, root.clone(), rw()).await;

        let sub_conn = dir.open(OpenFlags::DIRECTORY, rw(), "sub").unwrap();
        let token = sub_conn.get_token().await.unwrap();
        dir.rename("src", token, "dst").await.unwrap();

        assert!(!root.has_entry("src"));
        assert!(sub.has_entry("dst"));

        vfs.shutdown().await;
    }

    #[tokio::test]
    async fn watcher_replay_precedes_live_events() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        root.add("a", TestFile::new(b""));
        root.add("b", TestFile::new(b""));
        let dir = serve(&vfs, root, rw()).await;

        let mask = WatchMask::EXISTING | WatchMask::IDLE | WatchMask::ADDED;
        let watcher = dir.watch(mask).await.unwrap();

        // A mutation after registration must come after the replay.
        dir.open(OpenFlags::CREATE, rw(), "c").unwrap().close().await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let msg = watcher.recv().await.expect("watcher channel stays open");
            if let Payload::Event(Event::WatchBuffer { events }) = msg.body {
                seen.extend(decode_watch_events(&events).unwrap());
            }
        }
        assert_eq!(
            seen,
            vec![
                (WatchEvent::Existing, "a".to_owned()),
                (WatchEvent::Existing, "b".to_owned()),
                (WatchEvent::Idle, String::new()),
                (WatchEvent::Added, "c".to_owned()),
            ]
        );

        vfs.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_extension_tears_the_connection_down() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        root.add("f", TestFile::new(b""));
        let dir = serve(&vfs, root, rw()).await;
        let file = dir.open(OpenFlags::empty(), Rights::READ, "f").unwrap();

        assert_eq!(file.extension(99, vec![]).await.unwrap_err(), Status::PeerClosed);

        vfs.shutdown().await;
    }

    #[tokio::test]
    async fn blocking_lock_waits_for_release() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        root.add("f", TestFile::new(b""));
        let dir = serve(&vfs, root, rw()).await;

        let holder = dir.open(OpenFlags::empty(), rw(), "f").unwrap();
        holder.lock(LockKind::Exclusive, false).await.unwrap();

        let contender = dir.open(OpenFlags::empty(), rw(), "f").unwrap();
        assert_eq!(
            contender.lock(LockKind::Exclusive, false).await.unwrap_err(),
            Status::AccessDenied
        );

        let blocked = tokio::spawn(async move {
            contender.lock(LockKind::Exclusive, true).await.unwrap();
            contender
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        holder.unlock().await.unwrap();
        let contender = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("lock should be granted after release")
            .unwrap();
        contender.unlock().await.unwrap();

        vfs.shutdown().await;
    }

    /// File whose sync dwells long enough to race a shutdown.
    struct SlowSyncFile {
        core: NodeCore,
    }

    #[async_trait]
    impl Vnode for SlowSyncFile {
        fn core(&self) -> &NodeCore {
            &self.core
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn protocols(&self) -> ProtocolSet {
            ProtocolSet::FILE
        }

        async fn sync(&self) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_replies() {
        let vfs = Vfs::new();
        let file_node = Arc::new(SlowSyncFile { core: NodeCore::new() });
        let root = TestDir::new();
        root.add("f", file_node.clone());
        let dir = serve(&vfs, root, rw()).await;
        let file = dir.open(OpenFlags::empty(), rw(), "f").unwrap();

        let sync_call = tokio::spawn(async move {
            let result = file.sync().await;
            (result, file)
        });
        // Let the sync request reach the connection before shutting down.
        tokio::time::sleep(Duration::from_millis(20)).await;

        vfs.shutdown().await;

        // The in-flight reply completed before shutdown reported done, and
        // the balancing close ran.
        let (result, _file) = sync_call.await.unwrap();
        assert_eq!(result, Ok(()));
        assert_eq!(file_node.core().open_count(), 0);
    }

    #[tokio::test]
    async fn terminating_vfs_refuses_new_connections() {
        let vfs = Vfs::new();
        let root = TestDir::new();
        vfs.shutdown().await;

        let (server_end, client_end) = channel();
        vfs.serve_root(root, OpenFlags::DESCRIBE, Rights::READ, server_end)
            .await
            .unwrap();
        let client = Client::new(client_end);
        let (status, _) = client.expect_on_open().await.unwrap();
        assert_eq!(status, Err(Status::PeerClosed));
    }
}
