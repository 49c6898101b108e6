//! Minimal in-memory node implementations for exercising the framework.
//!
//! These are deliberately small: a `BTreeMap` directory and a `Vec<u8>`
//! file, enough to drive the walk, connection, and watcher machinery in
//! tests.  The example server crate carries a fuller in-memory filesystem.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Result, Status};
use crate::node::{NodeCore, Vnode};
use crate::protocol::ProtocolSet;
use crate::remote::{RemoteHandle, RemoteSlot};
use crate::rights::OpenOptions;
use crate::transport::Channel;
use crate::watcher::WatcherContainer;
use crate::wire::{encode_dirent, CreateKind, DirentKind, NodeAttributes};

/// A simple in-memory directory node.
pub struct TestDir {
    core: NodeCore,
    children: Mutex<BTreeMap<String, Arc<dyn Vnode>>>,
    watchers: WatcherContainer,
    remote: RemoteSlot,
}

impl TestDir {
    pub fn new() -> Arc<TestDir> {
        Arc::new(TestDir {
            core: NodeCore::new(),
            children: Mutex::new(BTreeMap::new()),
            watchers: WatcherContainer::new(),
            remote: RemoteSlot::new(),
        })
    }

    /// Inserts a child, replacing any existing entry with the same name.
    pub fn add(self: &Arc<Self>, name: &str, child: Arc<dyn Vnode>) -> Arc<Self> {
        self.children.lock().unwrap().insert(name.to_owned(), child);
        self.clone()
    }

    pub fn entry_names(&self) -> Vec<String> {
        self.children.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.children.lock().unwrap().contains_key(name)
    }
}

#[async_trait]
impl Vnode for TestDir {
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
        self.children
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(Status::NotFound)
    }

    async fn create(self: Arc<Self>, name: &str, kind: CreateKind) -> Result<Arc<dyn Vnode>> {
        let mut children = self.children.lock().unwrap();
        if children.contains_key(name) {
            return Err(Status::AlreadyExists);
        }
        let node: Arc<dyn Vnode> = match kind {
            CreateKind::File => TestFile::new(b""),
            CreateKind::Directory => TestDir::new(),
        };
        children.insert(name.to_owned(), node.clone());
        Ok(node)
    }

    async fn unlink(self: Arc<Self>, name: &str) -> Result<()> {
        match self.children.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(Status::NotFound),
        }
    }

    async fn rename(
        self: Arc<Self>,
        src: &str,
        dst_dir: Arc<dyn Vnode>,
        dst: &str,
    ) -> Result<()> {
        let dst_dir = dst_dir
            .as_any()
            .downcast_ref::<TestDir>()
            .ok_or(Status::NotSupported)?;
        if self.core.id() == dst_dir.core.id() {
            let mut children = self.children.lock().unwrap();
            let node = children.remove(src).ok_or(Status::NotFound)?;
            children.insert(dst.to_owned(), node);
        } else {
            let node = self
                .children
                .lock()
                .unwrap()
                .remove(src)
                .ok_or(Status::NotFound)?;
            dst_dir.children.lock().unwrap().insert(dst.to_owned(), node);
        }
        Ok(())
    }

    async fn link(
        self: Arc<Self>,
        src: &str,
        dst_dir: Arc<dyn Vnode>,
        dst: &str,
    ) -> Result<()> {
        let node = self
            .children
            .lock()
            .unwrap()
            .get(src)
            .cloned()
            .ok_or(Status::NotFound)?;
        let dst_dir = dst_dir
            .as_any()
            .downcast_ref::<TestDir>()
            .ok_or(Status::NotSupported)?;
        let mut children = dst_dir.children.lock().unwrap();
        if children.contains_key(dst) {
            return Err(Status::AlreadyExists);
        }
        children.insert(dst.to_owned(), node);
        Ok(())
    }

    async fn read_dirents(&self, cookie: u64, max_bytes: u64) -> Result<(Vec<u8>, u64)> {
        let children = self.children.lock().unwrap();
        let mut buf = Vec::new();
        let mut next = cookie;
        for (name, child) in children.iter().skip(cookie as usize) {
            let kind = child
                .protocols()
                .first()
                .map(DirentKind::from)
                .unwrap_or(DirentKind::Unknown);
            if !encode_dirent(&mut buf, max_bytes, child.core().id(), kind, name) {
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

/// A simple in-memory file node.
pub struct TestFile {
    core: NodeCore,
    content: Mutex<Vec<u8>>,
}

impl TestFile {
    pub fn new(content: &[u8]) -> Arc<TestFile> {
        Arc::new(TestFile {
            core: NodeCore::new(),
            content: Mutex::new(content.to_vec()),
        })
    }

    pub fn content(&self) -> Vec<u8> {
        self.content.lock().unwrap().clone()
    }
}

#[async_trait]
impl Vnode for TestFile {
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
        let content = self.content.lock().unwrap();
        let offset = offset as usize;
        if offset >= content.len() {
            return Ok(0);
        }
        let actual = buf.len().min(content.len() - offset);
        buf[..actual].copy_from_slice(&content[offset..offset + actual]);
        Ok(actual)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut content = self.content.lock().unwrap();
        let offset = offset as usize;
        let end = offset + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(data);
        Ok(data.len())
    }

    async fn append(&self, data: &[u8]) -> Result<(usize, u64)> {
        let mut content = self.content.lock().unwrap();
        content.extend_from_slice(data);
        Ok((data.len(), content.len() as u64))
    }

    async fn truncate(&self, length: u64) -> Result<()> {
        let mut content = self.content.lock().unwrap();
        content.resize(length as usize, 0);
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn get_attrs(&self) -> Result<NodeAttributes> {
        let content = self.content.lock().unwrap();
        Ok(NodeAttributes {
            id: self.core.id(),
            content_size: content.len() as u64,
            storage_size: content.len() as u64,
            link_count: 1,
            ..Default::default()
        })
    }
}
