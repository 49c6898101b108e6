//! The directory protocol connection.

use async_trait::async_trait;

use super::{
    error_response, send_on_open_error, Common, ConnectionState, RequestHandler, Responder,
};
use crate::error::{Result, Status};
use crate::remote::RemoteHandle;
use crate::rights::{check_child_open, OpenFlags, Rights};
use crate::transport::Channel;
use crate::wire::{Request, Response};

pub(crate) struct DirectoryConnection {
    common: Common,
    /// Readdir resume position, interpreted by the node.
    cookie: u64,
}

impl DirectoryConnection {
    pub(crate) fn new(common: Common) -> DirectoryConnection {
        DirectoryConnection { common, cookie: 0 }
    }

    /// Path-relative open.  Child flags and rights are checked against this
    /// connection before the walk starts, so hierarchical rights
    /// enforcement happens even when the walk would fail later.
    async fn handle_open(
        &mut self,
        flags: OpenFlags,
        rights: Rights,
        path: String,
        object: Channel,
    ) {
        match check_child_open(self.common.rights, flags, rights) {
            Err(status) => send_on_open_error(&object, flags, status),
            Ok((flags, rights)) => {
                let node = self.common.node.node().clone();
                let parent_rights = self.common.rights;
                match self.common.vfs.open(node, &path, flags, rights, parent_rights).await {
                    Ok(result) => self.common.vfs.serve(result, object).await,
                    Err(status) => send_on_open_error(&object, flags, status),
                }
            }
        }
    }

    fn require(&self, rights: Rights) -> Result<()> {
        if self.common.rights.contains(rights) {
            Ok(())
        } else {
            Err(Status::AccessDenied)
        }
    }

    async fn handle_unlink(&mut self, name: &str) -> Result<()> {
        self.require(Rights::WRITE)?;
        let node = self.common.node.node().clone();
        self.common.vfs.unlink(&node, name).await
    }

    async fn handle_readdir(&mut self, max_bytes: u64) -> Result<Vec<u8>> {
        let node = self.common.node.node().clone();
        let (entries, next) = self.common.vfs.readdir(&node, self.cookie, max_bytes).await?;
        self.cookie = next;
        Ok(entries)
    }

    fn handle_get_token(&mut self) -> Result<u64> {
        self.require(Rights::WRITE)?;
        if let Some(token) = self.common.token {
            return Ok(token);
        }
        let token = self.common.vfs.tokens().issue(self.common.node.node());
        self.common.token = Some(token);
        Ok(token)
    }
}

#[async_trait]
impl RequestHandler for DirectoryConnection {
    fn common(&mut self) -> &mut Common {
        &mut self.common
    }

    async fn handle_request(
        &mut self,
        req: Request,
        responder: Responder,
    ) -> Result<ConnectionState> {
        match req {
            Request::Open { flags, rights, path, object } => {
                self.handle_open(flags, rights, path, object).await;
            }
            Request::Unlink { name } => {
                let result = self.handle_unlink(&name).await;
                responder.send(Response::Unlink(result));
            }
            Request::ReadDir { max_bytes } => {
                let result = self.handle_readdir(max_bytes).await;
                responder.send(Response::ReadDir(result));
            }
            Request::Rewind => {
                self.cookie = 0;
                responder.send(Response::Rewind(Ok(())));
            }
            Request::GetToken => {
                let result = self.handle_get_token();
                responder.send(Response::GetToken(result));
            }
            Request::Rename { src, dst_token, dst } => {
                let result = match self.require(Rights::WRITE) {
                    Ok(()) => {
                        let node = self.common.node.node().clone();
                        self.common.vfs.rename(&node, &src, dst_token, &dst).await
                    }
                    Err(status) => Err(status),
                };
                responder.send(Response::Rename(result));
            }
            Request::Link { src, dst_token, dst } => {
                let result = match self.require(Rights::WRITE) {
                    Ok(()) => {
                        let node = self.common.node.node().clone();
                        self.common.vfs.link(&node, &src, dst_token, &dst).await
                    }
                    Err(status) => Err(status),
                };
                responder.send(Response::Link(result));
            }
            Request::Watch { mask, watcher } => {
                let node = self.common.node.node().clone();
                let result = self.common.vfs.watch_dir(&node, mask, watcher).await;
                responder.send(Response::Watch(result));
            }
            Request::Mount { remote } => {
                let result = match self.require(Rights::ADMIN) {
                    Ok(()) => {
                        let node = self.common.node.node().clone();
                        self.common.vfs.install_remote(node, RemoteHandle::new(remote))
                    }
                    Err(status) => Err(status),
                };
                responder.send(Response::Mount(result));
            }
            Request::Unmount => {
                if let Err(status) = self.require(Rights::ADMIN) {
                    responder.send(Response::Unmount(Err(status)));
                } else {
                    // Acknowledge first; the shutdown drains every live
                    // connection, this one included, so it cannot be
                    // awaited from here.
                    responder.send(Response::Unmount(Ok(())));
                    let vfs = self.common.vfs.clone();
                    tokio::spawn(async move { vfs.shutdown().await });
                    return Ok(ConnectionState::Closed);
                }
            }
            req @ (Request::Read { .. }
            | Request::ReadAt { .. }
            | Request::Write { .. }
            | Request::WriteAt { .. }
            | Request::Seek { .. }
            | Request::Truncate { .. }) => {
                if let Some(resp) = error_response(&req, Status::BadHandle) {
                    responder.send(resp);
                }
            }
            other => return self.common.handle_common(other, responder).await,
        }
        Ok(ConnectionState::Alive)
    }
}
