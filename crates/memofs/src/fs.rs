//! Mutable in-memory directories and files.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use vfserve::remote::{RemoteHandle, RemoteSlot};
use vfserve::transport::Channel;
use vfserve::watcher::WatcherContainer;
use vfserve::{
    encode_dirent, CreateKind, DirentKind, NodeAttributes, NodeCore, OpenOptions, ProtocolSet,
    Result, SetAttrMask, Status, Vnode,
};

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A writable in-memory file.
pub struct MemFile {
    core: NodeCore,
    inner: Mutex<FileInner>,
    link_count: AtomicU64,
}

struct FileInner {
    content: Vec<u8>,
    creation_time: u64,
    modification_time: u64,
}

impl MemFile {
    pub fn new(content: &[u8]) -> Arc<MemFile> {
        let now = now_nanos();
        Arc::new(MemFile {
            core: NodeCore::new(),
            inner: Mutex::new(FileInner {
                content: content.to_vec(),
                creation_time: now,
                modification_time: now,
            }),
            link_count: AtomicU64::new(1),
        })
    }

    pub fn content(&self) -> Vec<u8> {
        self.inner.lock().unwrap().content.clone()
    }

    fn add_link(&self) {
        self.link_count.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_link(&self) {
        self.link_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Vnode for MemFile {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn protocols(&self) -> ProtocolSet {
        ProtocolSet::FILE
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        let offset = offset as usize;
        if offset >= inner.content.len() {
            return Ok(0);
        }
        let actual = buf.len().min(inner.content.len() - offset);
        buf[..actual].copy_from_slice(&inner.content[offset..offset + actual]);
        Ok(actual)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let offset = offset as usize;
        let end = offset + data.len();
        if inner.content.len() < end {
            inner.content.resize(end, 0);
        }
        inner.content[offset..end].copy_from_slice(data);
        inner.modification_time = now_nanos();
        Ok(data.len())
    }

    async fn append(&self, data: &[u8]) -> Result<(usize, u64)> {
        let mut inner = self.inner.lock().unwrap();
        inner.content.extend_from_slice(data);
        inner.modification_time = now_nanos();
        Ok((data.len(), inner.content.len() as u64))
    }

    async fn truncate(&self, length: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.content.resize(length as usize, 0);
        inner.modification_time = now_nanos();
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn get_attrs(&self) -> Result<NodeAttributes> {
        let inner = self.inner.lock().unwrap();
        Ok(NodeAttributes {
            id: self.core.id(),
            content_size: inner.content.len() as u64,
            storage_size: inner.content.capacity() as u64,
            link_count: self.link_count.load(Ordering::SeqCst),
            creation_time: inner.creation_time,
            modification_time: inner.modification_time,
        })
    }

    async fn set_attrs(&self, valid: SetAttrMask, attrs: NodeAttributes) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if valid.contains(SetAttrMask::CREATION_TIME) {
            inner.creation_time = attrs.creation_time;
        }
        if valid.contains(SetAttrMask::MODIFICATION_TIME) {
            inner.modification_time = attrs.modification_time;
        }
        Ok(())
    }
}

/// A mutable in-memory directory, watchable and mountable.
pub struct MemDir {
    core: NodeCore,
    entries: Mutex<BTreeMap<String, Arc<dyn Vnode>>>,
    watchers: WatcherContainer,
    remote: RemoteSlot,
    creation_time: u64,
}

impl MemDir {
    pub fn new() -> Arc<MemDir> {
        Arc::new(MemDir {
            core: NodeCore::new(),
            entries: Mutex::new(BTreeMap::new()),
            watchers: WatcherContainer::new(),
            remote: RemoteSlot::new(),
            creation_time: now_nanos(),
        })
    }

    /// Direct insertion, for building trees before serving them.
    pub fn insert(self: &Arc<Self>, name: &str, node: Arc<dyn Vnode>) {
        self.entries.lock().unwrap().insert(name.to_owned(), node);
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }
}

#[async_trait]
impl Vnode for MemDir {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn protocols(&self) -> ProtocolSet {
        ProtocolSet::DIRECTORY
    }

    async fn lookup(self: Arc<Self>, name: &str) -> Result<Arc<dyn Vnode>> {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(Status::NotFound)
    }

    async fn create(self: Arc<Self>, name: &str, kind: CreateKind) -> Result<Arc<dyn Vnode>> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(name) {
            return Err(Status::AlreadyExists);
        }
        let node: Arc<dyn Vnode> = match kind {
            CreateKind::File => MemFile::new(b""),
            CreateKind::Directory => MemDir::new(),
        };
        entries.insert(name.to_owned(), node.clone());
        Ok(node)
    }

    async fn unlink(self: Arc<Self>, name: &str) -> Result<()> {
        let node = {
            let mut entries = self.entries.lock().unwrap();
            // A directory must be empty before it can be removed.
            if let Some(node) = entries.get(name) {
                if let Some(dir) = node.as_any().downcast_ref::<MemDir>() {
                    if !dir.entries.lock().unwrap().is_empty() {
                        return Err(Status::InvalidArgs);
                    }
                }
            }
            entries.remove(name).ok_or(Status::NotFound)?
        };
        if let Some(file) = node.as_any().downcast_ref::<MemFile>() {
            file.remove_link();
        }
        Ok(())
    }

    async fn rename(
        self: Arc<Self>,
        src: &str,
        dst_dir: Arc<dyn Vnode>,
        dst: &str,
    ) -> Result<()> {
        let dst_dir = dst_dir
            .as_any()
            .downcast_ref::<MemDir>()
            .ok_or(Status::NotSupported)?;
        if self.core.id() == dst_dir.core.id() {
            let mut entries = self.entries.lock().unwrap();
            let node = entries.remove(src).ok_or(Status::NotFound)?;
            entries.insert(dst.to_owned(), node);
            return Ok(());
        }
        let node = self
            .entries
            .lock()
            .unwrap()
            .remove(src)
            .ok_or(Status::NotFound)?;
        dst_dir.entries.lock().unwrap().insert(dst.to_owned(), node);
        Ok(())
    }

    async fn link(
        self: Arc<Self>,
        src: &str,
        dst_dir: Arc<dyn Vnode>,
        dst: &str,
    ) -> Result<()> {
        let node = self
            .entries
            .lock()
            .unwrap()
            .get(src)
            .cloned()
            .ok_or(Status::NotFound)?;
        // Hard links to directories are not a thing here.
        let file = node
            .as_any()
            .downcast_ref::<MemFile>()
            .ok_or(Status::NotFile)?;
        let dst_dir = dst_dir
            .as_any()
            .downcast_ref::<MemDir>()
            .ok_or(Status::NotSupported)?;
        {
            let mut entries = dst_dir.entries.lock().unwrap();
            if entries.contains_key(dst) {
                return Err(Status::AlreadyExists);
            }
            entries.insert(dst.to_owned(), node.clone());
        }
        file.add_link();
        Ok(())
    }

    async fn read_dirents(&self, cookie: u64, max_bytes: u64) -> Result<(Vec<u8>, u64)> {
        let entries = self.entries.lock().unwrap();
        let mut buf = Vec::new();
        let mut next = cookie;
        for (name, node) in entries.iter().skip(cookie as usize) {
            let kind = node
                .protocols()
                .first()
                .map(DirentKind::from)
                .unwrap_or(DirentKind::Unknown);
            if !encode_dirent(&mut buf, max_bytes, node.core().id(), kind, name) {
                break;
            }
            next += 1;
        }
        Ok((buf, next))
    }

    async fn get_attrs(&self) -> Result<NodeAttributes> {
        Ok(NodeAttributes {
            id: self.core.id(),
            link_count: 1,
            creation_time: self.creation_time,
            modification_time: self.creation_time,
            ..Default::default()
        })
    }

    fn watchers(&self) -> Option<&WatcherContainer> {
        Some(&self.watchers)
    }

    fn is_remote(&self) -> bool {
        self.remote.is_attached()
    }

    fn attach_remote(&self, remote: RemoteHandle) -> Result<()> {
        self.remote.attach(remote)
    }

    fn detach_remote(&self) -> Option<RemoteHandle> {
        self.remote.detach()
    }

    fn open_remote(&self, options: OpenOptions, path: &str, object: Channel) -> Result<()> {
        self.remote.forward(options, path, object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlink_refuses_non_empty_directories() {
        let root = MemDir::new();
        let sub = MemDir::new();
        sub.insert("kept", MemFile::new(b""));
        root.insert("sub", sub.clone());

        let err = root.clone().unlink("sub").await.unwrap_err();
        assert_eq!(err, Status::InvalidArgs);

        sub.clone().unlink("kept").await.unwrap();
        root.clone().unlink("sub").await.unwrap();
        assert!(!root.has_entry("sub"));
    }

    #[tokio::test]
    async fn link_tracks_link_counts() {
        let root = MemDir::new();
        let file = MemFile::new(b"x");
        root.insert("a", file.clone());

        root.clone().link("a", root.clone(), "b").await.unwrap();
        assert_eq!(file.get_attrs().await.unwrap().link_count, 2);

        root.clone().unlink("a").await.unwrap();
        assert_eq!(file.get_attrs().await.unwrap().link_count, 1);

        // Both names referenced the same node.
        assert!(root.has_entry("b"));
    }

    #[tokio::test]
    async fn link_rejects_directories() {
        let root = MemDir::new();
        root.insert("d", MemDir::new());
        let err = root.clone().link("d", root.clone(), "e").await.unwrap_err();
        assert_eq!(err, Status::NotFile);
    }
}
