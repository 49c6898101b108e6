//! End-to-end tests driving the in-memory filesystem through real
//! connections.

use std::sync::Arc;

use memofs::{demo_root, MemDir, MemFile, NullDevice, ZeroDevice};
use vfserve::client::Client;
use vfserve::remote::RemoteHandle;
use vfserve::transport::channel;
use vfserve::watcher::{decode_watch_events, WatchEvent, WatchMask};
use vfserve::{
    Event, NodeInfo, OpenFlags, Payload, Rights, SeekOrigin, Status, Vfs, Vnode,
};

async fn serve(vfs: &Arc<Vfs>, root: Arc<dyn Vnode>, rights: Rights) -> Client {
    let (server_end, client_end) = channel();
    vfs.serve_root(root, OpenFlags::empty(), rights, server_end)
        .await
        .expect("serving the root should succeed");
    Client::new(client_end)
}

fn rw() -> Rights {
    Rights::READ | Rights::WRITE
}

#[tokio::test]
async fn null_device_reads_eof_and_swallows_writes() {
    let vfs = Vfs::new();
    let root = MemDir::new();
    root.insert("null", NullDevice::new());
    let dir = serve(&vfs, root, rw()).await;

    let null = dir.open(OpenFlags::empty(), rw(), "null").unwrap();
    assert_eq!(null.read(512).await.unwrap(), b"");
    assert_eq!(null.write(b"discarded entirely").await.unwrap(), 18);
    assert_eq!(null.read(512).await.unwrap(), b"");

    vfs.shutdown().await;
}

#[tokio::test]
async fn zero_device_reads_zeroes_and_swallows_writes() {
    let vfs = Vfs::new();
    let root = MemDir::new();
    root.insert("zero", ZeroDevice::new());
    let dir = serve(&vfs, root, rw()).await;

    let zero = dir.open(OpenFlags::empty(), rw(), "zero").unwrap();
    let data = zero.read(64).await.unwrap();
    assert_eq!(data, vec![0u8; 64]);
    assert_eq!(zero.write(b"vanishes").await.unwrap(), 8);
    assert_eq!(zero.read(16).await.unwrap(), vec![0u8; 16]);

    vfs.shutdown().await;
}

#[tokio::test]
async fn negotiation_is_deterministic_for_multi_protocol_nodes() {
    // The zero device speaks both the file and device protocols; the
    // declaration-order tie-break must pick the file protocol every time.
    let vfs = Vfs::new();
    let root = MemDir::new();
    root.insert("zero", ZeroDevice::new());
    let dir = serve(&vfs, root, rw()).await;

    for _ in 0..10 {
        let conn = dir.open(OpenFlags::DESCRIBE, Rights::READ, "zero").unwrap();
        let (status, info) = conn.expect_on_open().await.unwrap();
        assert_eq!(status, Ok(()));
        assert_eq!(info, Some(NodeInfo::File { append: false }));
        conn.close().await.unwrap();
    }

    vfs.shutdown().await;
}

#[tokio::test]
async fn dot_dot_is_rejected_over_the_wire() {
    let vfs = Vfs::new();
    let root = demo_root();
    let dir = serve(&vfs, root, rw()).await;

    for path in ["..", "../dev", "dev/..", "dev/../dev/null"] {
        let conn = dir.open(OpenFlags::DESCRIBE, Rights::READ, path).unwrap();
        let (status, _) = conn.expect_on_open().await.unwrap();
        assert_eq!(status, Err(Status::InvalidArgs), "path {path:?}");
    }

    // The dot path resolves to the directory itself.
    let this = dir.open(OpenFlags::DESCRIBE, Rights::READ, ".").unwrap();
    let (status, info) = this.expect_on_open().await.unwrap();
    assert_eq!(status, Ok(()));
    assert_eq!(info, Some(NodeInfo::Directory));

    vfs.shutdown().await;
}

#[tokio::test]
async fn create_with_fail_if_exists_does_not_mutate() {
    let vfs = Vfs::new();
    let root = MemDir::new();
    root.insert("taken", MemFile::new(b"original"));
    let dir = serve(&vfs, root.clone(), rw()).await;

    let flags = OpenFlags::CREATE | OpenFlags::FAIL_IF_EXISTS | OpenFlags::DESCRIBE;
    let conn = dir.open(flags, rw(), "taken").unwrap();
    let (status, _) = conn.expect_on_open().await.unwrap();
    assert_eq!(status, Err(Status::AlreadyExists));

    assert_eq!(root.entry_names(), ["taken"]);
    let file = dir.open(OpenFlags::empty(), Rights::READ, "taken").unwrap();
    assert_eq!(file.read(64).await.unwrap(), b"original");

    vfs.shutdown().await;
}

#[tokio::test]
async fn missing_intermediate_component_fails_with_not_found() {
    // Only "a" exists; "a/b/c" must die at "b" even with CREATE, because
    // intermediate segments are never created implicitly.
    let vfs = Vfs::new();
    let root = MemDir::new();
    root.insert("a", MemDir::new());
    let dir = serve(&vfs, root, rw()).await;

    let conn = dir
        .open(OpenFlags::CREATE | OpenFlags::DESCRIBE, rw(), "a/b/c")
        .unwrap();
    let (status, _) = conn.expect_on_open().await.unwrap();
    assert_eq!(status, Err(Status::NotFound));

    vfs.shutdown().await;
}

#[tokio::test]
async fn child_opens_never_widen_rights() {
    let vfs = Vfs::new();
    let root = MemDir::new();
    root.insert("f", MemFile::new(b"secret"));
    let dir = serve(&vfs, root, Rights::READ).await;

    let conn = dir.open(OpenFlags::DESCRIBE, rw(), "f").unwrap();
    let (status, _) = conn.expect_on_open().await.unwrap();
    assert_eq!(status, Err(Status::AccessDenied));

    // And CREATE needs a writable parent connection.
    let conn = dir
        .open(OpenFlags::CREATE | OpenFlags::DESCRIBE, Rights::READ, "new")
        .unwrap();
    let (status, _) = conn.expect_on_open().await.unwrap();
    assert_eq!(status, Err(Status::AccessDenied));

    vfs.shutdown().await;
}

#[tokio::test]
async fn watcher_replay_then_idle_then_live_events() {
    let vfs = Vfs::new();
    let root = MemDir::new();
    root.insert("a", MemFile::new(b""));
    root.insert("b", MemFile::new(b""));
    let dir = serve(&vfs, root, rw()).await;

    let mask = WatchMask::ADDED | WatchMask::REMOVED | WatchMask::EXISTING | WatchMask::IDLE;
    let watcher = dir.watch(mask).await.unwrap();

    dir.open(OpenFlags::CREATE, rw(), "c").unwrap().close().await.unwrap();
    dir.unlink("a").await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 5 {
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
            (WatchEvent::Removed, "a".to_owned()),
        ]
    );

    vfs.shutdown().await;
}

#[tokio::test]
async fn hard_links_share_content_and_count() {
    let vfs = Vfs::new();
    let root = MemDir::new();
    root.insert("orig", MemFile::new(b"shared"));
    let dir = serve(&vfs, root, rw()).await;

    let token = dir.get_token().await.unwrap();
    dir.link("orig", token, "alias").await.unwrap();

    let alias = dir.open(OpenFlags::empty(), rw(), "alias").unwrap();
    assert_eq!(alias.read(64).await.unwrap(), b"shared");
    assert_eq!(alias.get_attrs().await.unwrap().link_count, 2);

    alias.write_at(0, b"SHARED").await.unwrap();
    let orig = dir.open(OpenFlags::empty(), Rights::READ, "orig").unwrap();
    assert_eq!(orig.read(64).await.unwrap(), b"SHARED");

    vfs.shutdown().await;
}

#[tokio::test]
async fn write_truncate_seek_round_trip() {
    let vfs = Vfs::new();
    let root = MemDir::new();
    let dir = serve(&vfs, root, rw()).await;

    let file = dir
        .open(OpenFlags::CREATE, rw(), "notes.txt")
        .unwrap();
    file.write(b"line one\nline two\n").await.unwrap();
    assert_eq!(file.get_attrs().await.unwrap().content_size, 18);

    file.truncate(9).await.unwrap();
    file.seek(SeekOrigin::Start, 0).await.unwrap();
    assert_eq!(file.read(64).await.unwrap(), b"line one\n");

    vfs.shutdown().await;
}

#[tokio::test]
async fn mount_crossing_and_unmount_signal() {
    // The mounted filesystem lives behind its own vfs and its own root
    // connection; opens that reach the mount point are forwarded across.
    let remote_vfs = Vfs::new();
    let remote_root = MemDir::new();
    remote_root.insert("inside", MemFile::new(b"over the mount"));
    let (remote_server, remote_client) = channel();
    remote_vfs
        .serve_root(remote_root, OpenFlags::empty(), Rights::all(), remote_server)
        .await
        .unwrap();

    let vfs = Vfs::new();
    let root = MemDir::new();
    let mount_point = MemDir::new();
    root.insert("mnt", mount_point.clone());
    let mount_node: Arc<dyn Vnode> = mount_point;
    vfs.install_remote(mount_node.clone(), RemoteHandle::new(remote_client))
        .unwrap();

    let dir = serve(&vfs, root, rw()).await;

    // Walks crossing the mount are served by the remote filesystem.
    let inside = dir.open(OpenFlags::empty(), Rights::READ, "mnt/inside").unwrap();
    assert_eq!(inside.read(64).await.unwrap(), b"over the mount");

    // Opening the mount point itself crosses too: the connection lands on
    // the remote root directory.
    let mnt = dir.open(OpenFlags::empty(), Rights::READ, "mnt").unwrap();
    let names: Vec<String> = mnt
        .readdir(8192)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["inside"]);

    // Uninstalling delivers the unmount signal; the remote filesystem
    // shuts down in response.
    vfs.uninstall_remote(&mount_node).await.unwrap();
    for _ in 0..100 {
        if remote_vfs.is_terminating() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(remote_vfs.is_terminating());

    // The mount point serves locally again.
    let mnt = dir.open(OpenFlags::empty(), Rights::READ, "mnt").unwrap();
    assert!(mnt.readdir(8192).await.unwrap().is_empty());

    vfs.shutdown().await;
}

#[tokio::test]
async fn demo_tree_has_the_expected_layout() {
    let vfs = Vfs::new();
    let dir = serve(&vfs, demo_root(), rw()).await;

    let names: Vec<String> = dir
        .readdir(8192)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["dev", "tmp"]);

    let dev = dir.open(OpenFlags::DIRECTORY, Rights::READ, "dev").unwrap();
    let names: Vec<String> = dev
        .readdir(8192)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, ["null", "zero"]);

    vfs.shutdown().await;
}
