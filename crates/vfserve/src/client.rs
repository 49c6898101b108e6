//! A thin typed client over a connection channel.
//!
//! Allocates transaction ids, matches replies to requests, and queues
//! unsolicited events for separate consumption.  This is the substrate the
//! test suites and example binaries drive connections with, and what the
//! remote-mount machinery uses to speak to a remote root; mount policy does
//! not live here.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::error::{Result, Status};
use crate::lock::LockKind;
use crate::rights::{OpenFlags, Rights};
use crate::transport::{channel, Channel};
use crate::watcher::WatchMask;
use crate::wire::{
    decode_dirents, Dirent, Event, Message, NodeAttributes, NodeInfo, Payload, Request, Response,
    SeekOrigin, SetAttrMask,
};

#[derive(Debug)]
pub struct Client {
    channel: Channel,
    next_txid: AtomicU64,
    events: Mutex<VecDeque<Event>>,
}

impl Client {
    pub fn new(channel: Channel) -> Client {
        Client {
            channel,
            next_txid: AtomicU64::new(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn alloc_txid(&self) -> u64 {
        self.next_txid.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends a request and waits for its reply, queueing any events that
    /// arrive in between.
    pub async fn call(&self, req: Request) -> Result<Response> {
        let txid = self.alloc_txid();
        self.channel.send(Message::request(txid, req))?;
        loop {
            let msg = self.channel.recv().await.ok_or(Status::PeerClosed)?;
            match msg.body {
                Payload::Event(event) => self.events.lock().unwrap().push_back(event),
                Payload::Response(resp) if msg.txid == txid => return Ok(resp),
                Payload::Response(resp) => {
                    debug!("dropping reply with stale txid {}: {:?}", msg.txid, resp);
                }
                Payload::Request(req) => {
                    debug!("server sent a request: {:?}", req.method());
                    return Err(Status::Internal);
                }
            }
        }
    }

    /// The next unsolicited event on this connection.
    pub async fn next_event(&self) -> Result<Event> {
        if let Some(event) = self.events.lock().unwrap().pop_front() {
            return Ok(event);
        }
        loop {
            let msg = self.channel.recv().await.ok_or(Status::PeerClosed)?;
            if let Payload::Event(event) = msg.body {
                return Ok(event);
            }
            debug!("dropping non-event message while waiting for an event");
        }
    }

    /// Waits for the initial on-open event of a `DESCRIBE` open.
    pub async fn expect_on_open(&self) -> Result<(Result<()>, Option<NodeInfo>)> {
        match self.next_event().await? {
            Event::OnOpen { status, info } => Ok((status, info)),
            other => {
                debug!("expected an on-open event, got {other:?}");
                Err(Status::Internal)
            }
        }
    }

    /// Opens `path` relative to this (directory) connection.  Pipelined:
    /// the returned client is usable immediately and failures surface on
    /// first use, or through the on-open event when `DESCRIBE` is set.
    pub fn open(&self, flags: OpenFlags, rights: Rights, path: &str) -> Result<Client> {
        let (server, client) = channel();
        self.open_with(flags, rights, path, server)?;
        Ok(Client::new(client))
    }

    /// Opens `path` handing off a caller-provided server end.
    pub fn open_with(
        &self,
        flags: OpenFlags,
        rights: Rights,
        path: &str,
        object: Channel,
    ) -> Result<()> {
        let txid = self.alloc_txid();
        self.channel.send(Message::request(
            txid,
            Request::Open { flags, rights, path: path.to_owned(), object },
        ))
    }

    /// Clones this connection.  Pipelined, like `open`.
    pub fn clone_conn(&self, flags: OpenFlags, rights: Rights) -> Result<Client> {
        let (server, client) = channel();
        let txid = self.alloc_txid();
        self.channel
            .send(Message::request(txid, Request::Clone { flags, rights, object: server }))?;
        Ok(Client::new(client))
    }

    pub async fn close(&self) -> Result<()> {
        match self.call(Request::Close).await? {
            Response::Close(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn describe(&self) -> Result<NodeInfo> {
        match self.call(Request::Describe).await? {
            Response::Describe(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn sync(&self) -> Result<()> {
        match self.call(Request::Sync).await? {
            Response::Sync(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn get_attrs(&self) -> Result<NodeAttributes> {
        match self.call(Request::GetAttrs).await? {
            Response::GetAttrs(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn set_attrs(&self, valid: SetAttrMask, attrs: NodeAttributes) -> Result<()> {
        match self.call(Request::SetAttrs { valid, attrs }).await? {
            Response::SetAttrs(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn get_flags(&self) -> Result<OpenFlags> {
        match self.call(Request::GetFlags).await? {
            Response::GetFlags(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn set_flags(&self, flags: OpenFlags) -> Result<()> {
        match self.call(Request::SetFlags { flags }).await? {
            Response::SetFlags(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn read(&self, count: u64) -> Result<Vec<u8>> {
        match self.call(Request::Read { count }).await? {
            Response::Read(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn read_at(&self, offset: u64, count: u64) -> Result<Vec<u8>> {
        match self.call(Request::ReadAt { offset, count }).await? {
            Response::Read(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<u64> {
        match self.call(Request::Write { data: data.to_vec() }).await? {
            Response::Write(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<u64> {
        match self.call(Request::WriteAt { offset, data: data.to_vec() }).await? {
            Response::Write(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn seek(&self, origin: SeekOrigin, offset: i64) -> Result<u64> {
        match self.call(Request::Seek { origin, offset }).await? {
            Response::Seek(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn truncate(&self, length: u64) -> Result<()> {
        match self.call(Request::Truncate { length }).await? {
            Response::Truncate(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn readdir(&self, max_bytes: u64) -> Result<Vec<Dirent>> {
        match self.call(Request::ReadDir { max_bytes }).await? {
            Response::ReadDir(r) => decode_dirents(&r?),
            _ => Err(Status::Internal),
        }
    }

    pub async fn rewind(&self) -> Result<()> {
        match self.call(Request::Rewind).await? {
            Response::Rewind(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn get_token(&self) -> Result<u64> {
        match self.call(Request::GetToken).await? {
            Response::GetToken(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn rename(&self, src: &str, dst_token: u64, dst: &str) -> Result<()> {
        let req = Request::Rename { src: src.to_owned(), dst_token, dst: dst.to_owned() };
        match self.call(req).await? {
            Response::Rename(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn link(&self, src: &str, dst_token: u64, dst: &str) -> Result<()> {
        let req = Request::Link { src: src.to_owned(), dst_token, dst: dst.to_owned() };
        match self.call(req).await? {
            Response::Link(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn unlink(&self, name: &str) -> Result<()> {
        match self.call(Request::Unlink { name: name.to_owned() }).await? {
            Response::Unlink(r) => r,
            _ => Err(Status::Internal),
        }
    }

    /// Installs a watcher, returning the client end of the watcher channel.
    pub async fn watch(&self, mask: WatchMask) -> Result<Channel> {
        let (server, client) = channel();
        match self.call(Request::Watch { mask, watcher: server }).await? {
            Response::Watch(r) => r.map(|()| client),
            _ => Err(Status::Internal),
        }
    }

    pub async fn lock(&self, kind: LockKind, blocking: bool) -> Result<()> {
        match self.call(Request::Lock { kind, blocking }).await? {
            Response::Lock(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn unlock(&self) -> Result<()> {
        match self.call(Request::Unlock).await? {
            Response::Unlock(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn mount(&self, remote: Channel) -> Result<()> {
        match self.call(Request::Mount { remote }).await? {
            Response::Mount(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn unmount(&self) -> Result<()> {
        match self.call(Request::Unmount).await? {
            Response::Unmount(r) => r,
            _ => Err(Status::Internal),
        }
    }

    pub async fn extension(&self, op: u32, payload: Vec<u8>) -> Result<Vec<u8>> {
        match self.call(Request::Extension { op, payload }).await? {
            Response::Extension(r) => r,
            _ => Err(Status::Internal),
        }
    }
}
