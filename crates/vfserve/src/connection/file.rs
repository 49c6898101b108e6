//! The file protocol connection.
//!
//! Two I/O shapes share this connection.  A node that hands out a byte
//! stream gets its reads, writes, and seeks delegated straight to that
//! stream.  Every other file node is driven through explicit offsets: the
//! connection tracks the position itself, performs the seek-origin
//! arithmetic with overflow and underflow rejected, and calls the node's
//! positional operations.

use std::io::SeekFrom;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{error_response, send_on_open_error, Common, ConnectionState, RequestHandler, Responder};
use crate::error::{Result, Status};
use crate::node::FileStream;
use crate::rights::{OpenFlags, Rights};
use crate::wire::{Request, Response, SeekOrigin, MAX_TRANSFER};

enum FileIo {
    /// Direct stream I/O; the stream owns the position.
    Stream(Box<dyn FileStream>),
    /// Explicit position tracked by the connection.
    Offset(u64),
}

pub(crate) struct FileConnection {
    common: Common,
    io: FileIo,
}

impl FileConnection {
    pub(crate) fn new(common: Common, stream: Option<Box<dyn FileStream>>) -> FileConnection {
        let io = match stream {
            Some(stream) => FileIo::Stream(stream),
            None => FileIo::Offset(0),
        };
        FileConnection { common, io }
    }

    fn check_transfer(&self, rights: Rights, len: u64) -> Result<()> {
        if !self.common.rights.contains(rights) {
            return Err(Status::AccessDenied);
        }
        if len > MAX_TRANSFER {
            return Err(Status::OutOfRange);
        }
        Ok(())
    }

    async fn handle_read(&mut self, count: u64) -> Result<Vec<u8>> {
        self.check_transfer(Rights::READ, count)?;
        let mut buf = vec![0; count as usize];
        let actual = match &mut self.io {
            FileIo::Offset(pos) => {
                let actual = self.common.node.read_at(*pos, &mut buf).await?;
                *pos += actual as u64;
                actual
            }
            FileIo::Stream(stream) => stream.read(&mut buf).await?,
        };
        buf.truncate(actual);
        Ok(buf)
    }

    async fn handle_read_at(&mut self, offset: u64, count: u64) -> Result<Vec<u8>> {
        self.check_transfer(Rights::READ, count)?;
        let mut buf = vec![0; count as usize];
        let actual = match &mut self.io {
            FileIo::Offset(_) => self.common.node.read_at(offset, &mut buf).await?,
            FileIo::Stream(stream) => {
                // Positional reads must not move the stream position.
                let saved = stream.seek(SeekFrom::Current(0)).await?;
                stream.seek(SeekFrom::Start(offset)).await?;
                let actual = stream.read(&mut buf).await?;
                stream.seek(SeekFrom::Start(saved)).await?;
                actual
            }
        };
        buf.truncate(actual);
        Ok(buf)
    }

    async fn handle_write(&mut self, data: &[u8]) -> Result<u64> {
        self.check_transfer(Rights::WRITE, data.len() as u64)?;
        let append = self.common.flags.contains(OpenFlags::APPEND);
        match &mut self.io {
            FileIo::Offset(pos) => {
                if append {
                    let (actual, end) = self.common.node.append(data).await?;
                    *pos = end;
                    Ok(actual as u64)
                } else {
                    let actual = self.common.node.write_at(*pos, data).await?;
                    *pos += actual as u64;
                    Ok(actual as u64)
                }
            }
            FileIo::Stream(stream) => {
                if append {
                    stream.seek(SeekFrom::End(0)).await?;
                }
                let actual = stream.write(data).await?;
                Ok(actual as u64)
            }
        }
    }

    async fn handle_write_at(&mut self, offset: u64, data: &[u8]) -> Result<u64> {
        self.check_transfer(Rights::WRITE, data.len() as u64)?;
        match &mut self.io {
            FileIo::Offset(_) => Ok(self.common.node.write_at(offset, data).await? as u64),
            FileIo::Stream(stream) => {
                let saved = stream.seek(SeekFrom::Current(0)).await?;
                stream.seek(SeekFrom::Start(offset)).await?;
                let actual = stream.write(data).await?;
                stream.seek(SeekFrom::Start(saved)).await?;
                Ok(actual as u64)
            }
        }
    }

    async fn handle_seek(&mut self, origin: SeekOrigin, offset: i64) -> Result<u64> {
        match &mut self.io {
            FileIo::Offset(pos) => {
                let base: i128 = match origin {
                    SeekOrigin::Start => 0,
                    SeekOrigin::Current => *pos as i128,
                    SeekOrigin::End => {
                        self.common.node.get_attrs().await?.content_size as i128
                    }
                };
                let target = base + offset as i128;
                if target < 0 || target > u64::MAX as i128 {
                    return Err(Status::OutOfRange);
                }
                *pos = target as u64;
                Ok(*pos)
            }
            FileIo::Stream(stream) => {
                let from = match origin {
                    SeekOrigin::Start => {
                        if offset < 0 {
                            return Err(Status::OutOfRange);
                        }
                        SeekFrom::Start(offset as u64)
                    }
                    SeekOrigin::Current => SeekFrom::Current(offset),
                    SeekOrigin::End => SeekFrom::End(offset),
                };
                Ok(stream.seek(from).await?)
            }
        }
    }

    async fn handle_truncate(&mut self, length: u64) -> Result<()> {
        if !self.common.rights.contains(Rights::WRITE) {
            return Err(Status::AccessDenied);
        }
        self.common.node.truncate(length).await
    }
}

#[async_trait]
impl RequestHandler for FileConnection {
    fn common(&mut self) -> &mut Common {
        &mut self.common
    }

    async fn handle_request(
        &mut self,
        req: Request,
        responder: Responder,
    ) -> Result<ConnectionState> {
        match req {
            Request::Read { count } => {
                let result = self.handle_read(count).await;
                responder.send(Response::Read(result));
            }
            Request::ReadAt { offset, count } => {
                let result = self.handle_read_at(offset, count).await;
                responder.send(Response::Read(result));
            }
            Request::Write { data } => {
                let result = self.handle_write(&data).await;
                responder.send(Response::Write(result));
            }
            Request::WriteAt { offset, data } => {
                let result = self.handle_write_at(offset, &data).await;
                responder.send(Response::Write(result));
            }
            Request::Seek { origin, offset } => {
                let result = self.handle_seek(origin, offset).await;
                responder.send(Response::Seek(result));
            }
            Request::Truncate { length } => {
                let result = self.handle_truncate(length).await;
                responder.send(Response::Truncate(result));
            }
            Request::Open { flags, object, .. } => {
                send_on_open_error(&object, flags, Status::BadHandle);
            }
            req @ (Request::Unlink { .. }
            | Request::ReadDir { .. }
            | Request::Rewind
            | Request::GetToken
            | Request::Rename { .. }
            | Request::Link { .. }
            | Request::Watch { .. }
            | Request::Mount { .. }
            | Request::Unmount) => {
                if let Some(resp) = error_response(&req, Status::BadHandle) {
                    responder.send(resp);
                }
            }
            other => return self.common.handle_common(other, responder).await,
        }
        Ok(ConnectionState::Alive)
    }
}
