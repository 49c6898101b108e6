//! The structured message set spoken over a connection's channel.
//!
//! Every request carries a transaction id chosen by the client; the reply
//! echoes it.  `Open` and `Clone` are pipelined and never get a reply; the
//! outcome is observed through the handed-off channel, and through the
//! unsolicited [`Event::OnOpen`] when `DESCRIBE` was requested.  Event
//! messages use transaction id zero.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use enum_primitive::*;

use crate::error::{Result, Status};
use crate::lock::LockKind;
use crate::path::MAX_NAME_LEN;
use crate::protocol::Protocol;
use crate::rights::{OpenFlags, Rights};
use crate::transport::Channel;
use crate::watcher::WatchMask;

/// Transaction id used by unsolicited event messages.
pub const EVENT_TXID: u64 = 0;

/// Largest single read or write transfer, in bytes.
pub const MAX_TRANSFER: u64 = 8192;

/// Largest directory-entry buffer a single readdir may return.
pub const MAX_DIRENTS_BYTES: u64 = 8192;

bitflags::bitflags! {
    /// Selects which attribute fields a set-attributes request applies.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct SetAttrMask: u32 {
        const CREATION_TIME     = 1 << 0;
        const MODIFICATION_TIME = 1 << 1;
    }
}

/// Node metadata, as reported by get-attributes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeAttributes {
    /// Unique id of the node within its filesystem.
    pub id: u64,
    /// Content size in bytes.
    pub content_size: u64,
    /// Storage consumed, in bytes.
    pub storage_size: u64,
    /// Number of directory entries referencing the node.
    pub link_count: u64,
    /// Creation time, nanoseconds since the epoch.
    pub creation_time: u64,
    /// Last modification time, nanoseconds since the epoch.
    pub modification_time: u64,
}

/// Origin for seek arithmetic on a file connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

/// Initial description of a node, sent in `OnOpen` events and `Describe`
/// replies, tagged by the connection's negotiated protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeInfo {
    Connector,
    File { append: bool },
    Directory,
    Device,
    Tty,
    Pipe,
    Memory,
    /// An attribute-only node-reference handle.
    Node,
}

impl NodeInfo {
    pub fn for_protocol(protocol: Protocol, flags: OpenFlags) -> NodeInfo {
        if flags.contains(OpenFlags::NODE_REFERENCE) {
            return NodeInfo::Node;
        }
        match protocol {
            Protocol::Connector => NodeInfo::Connector,
            Protocol::File => NodeInfo::File { append: flags.contains(OpenFlags::APPEND) },
            Protocol::Directory => NodeInfo::Directory,
            Protocol::Device => NodeInfo::Device,
            Protocol::Tty => NodeInfo::Tty,
            Protocol::Pipe => NodeInfo::Pipe,
            Protocol::Memory => NodeInfo::Memory,
        }
    }
}

/// Kind of node being created by an open with `CREATE`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CreateKind {
    File,
    Directory,
}

/// A request message.
#[derive(Debug)]
pub enum Request {
    // Common node operations.
    Clone { flags: OpenFlags, rights: Rights, object: Channel },
    Close,
    Describe,
    Sync,
    GetAttrs,
    SetAttrs { valid: SetAttrMask, attrs: NodeAttributes },
    GetFlags,
    SetFlags { flags: OpenFlags },
    Lock { kind: LockKind, blocking: bool },
    Unlock,
    /// Escape hatch for node-defined operations (connector services).
    Extension { op: u32, payload: Vec<u8> },

    // Directory operations.
    Open { flags: OpenFlags, rights: Rights, path: String, object: Channel },
    Unlink { name: String },
    ReadDir { max_bytes: u64 },
    Rewind,
    GetToken,
    Rename { src: String, dst_token: u64, dst: String },
    Link { src: String, dst_token: u64, dst: String },
    Watch { mask: WatchMask, watcher: Channel },
    Mount { remote: Channel },
    Unmount,

    // File operations.
    Read { count: u64 },
    ReadAt { offset: u64, count: u64 },
    Write { data: Vec<u8> },
    WriteAt { offset: u64, data: Vec<u8> },
    Seek { origin: SeekOrigin, offset: i64 },
    Truncate { length: u64 },
}

impl Request {
    /// Short operation name for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Clone { .. } => "clone",
            Request::Close => "close",
            Request::Describe => "describe",
            Request::Sync => "sync",
            Request::GetAttrs => "get_attrs",
            Request::SetAttrs { .. } => "set_attrs",
            Request::GetFlags => "get_flags",
            Request::SetFlags { .. } => "set_flags",
            Request::Lock { .. } => "lock",
            Request::Unlock => "unlock",
            Request::Extension { .. } => "extension",
            Request::Open { .. } => "open",
            Request::Unlink { .. } => "unlink",
            Request::ReadDir { .. } => "readdir",
            Request::Rewind => "rewind",
            Request::GetToken => "get_token",
            Request::Rename { .. } => "rename",
            Request::Link { .. } => "link",
            Request::Watch { .. } => "watch",
            Request::Mount { .. } => "mount",
            Request::Unmount => "unmount",
            Request::Read { .. } => "read",
            Request::ReadAt { .. } => "read_at",
            Request::Write { .. } => "write",
            Request::WriteAt { .. } => "write_at",
            Request::Seek { .. } => "seek",
            Request::Truncate { .. } => "truncate",
        }
    }
}

/// A reply message.
///
/// Every variant carries the operation's status explicitly: the `Err` side
/// is always a [`Status`] from the fixed taxonomy, never a torn channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Close(Result<()>),
    Describe(Result<NodeInfo>),
    Sync(Result<()>),
    GetAttrs(Result<NodeAttributes>),
    SetAttrs(Result<()>),
    GetFlags(Result<OpenFlags>),
    SetFlags(Result<()>),
    Lock(Result<()>),
    Unlock(Result<()>),
    Extension(Result<Vec<u8>>),
    Unlink(Result<()>),
    ReadDir(Result<Vec<u8>>),
    Rewind(Result<()>),
    GetToken(Result<u64>),
    Rename(Result<()>),
    Link(Result<()>),
    Watch(Result<()>),
    Mount(Result<()>),
    Unmount(Result<()>),
    Read(Result<Vec<u8>>),
    Write(Result<u64>),
    Seek(Result<u64>),
    Truncate(Result<()>),
}

impl Response {
    /// The status carried by the reply, collapsed to `Result<()>`.
    pub fn status(&self) -> Result<()> {
        use Response::*;
        match self {
            Close(r) | Sync(r) | SetAttrs(r) | SetFlags(r) | Lock(r) | Unlock(r)
            | Unlink(r) | Rewind(r) | Rename(r) | Link(r) | Watch(r) | Mount(r)
            | Unmount(r) | Truncate(r) => *r,
            Describe(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
            GetAttrs(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
            GetFlags(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
            Extension(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
            ReadDir(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
            GetToken(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
            Read(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
            Write(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
            Seek(r) => r.as_ref().map(|_| ()).map_err(|e| *e),
        }
    }
}

/// An unsolicited event message, sent with [`EVENT_TXID`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Initial description of an opened node, delivered when the open
    /// requested `DESCRIBE`.  Sent even when the open failed, so a caller
    /// that asked to be told the outcome is always told.
    OnOpen { status: Result<()>, info: Option<NodeInfo> },
    /// A buffer of encoded watch events, delivered on watcher channels.
    WatchBuffer { events: Vec<u8> },
}

/// Message envelope.
#[derive(Debug)]
pub struct Message {
    /// Chosen by the client to identify the request; the reply echoes it.
    pub txid: u64,
    pub body: Payload,
}

#[derive(Debug)]
pub enum Payload {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Message {
    pub fn request(txid: u64, req: Request) -> Message {
        Message { txid, body: Payload::Request(req) }
    }

    pub fn response(txid: u64, resp: Response) -> Message {
        Message { txid, body: Payload::Response(resp) }
    }

    pub fn event(event: Event) -> Message {
        Message { txid: EVENT_TXID, body: Payload::Event(event) }
    }
}

enum_from_primitive! {
    #[doc = "Entry kind byte carried in encoded directory entries"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum DirentKind {
        Unknown   = 0,
        Connector = 1,
        File      = 2,
        Directory = 3,
        Device    = 4,
        Tty       = 5,
        Pipe      = 6,
        Memory    = 7,
    }
}

impl From<Protocol> for DirentKind {
    fn from(p: Protocol) -> DirentKind {
        match p {
            Protocol::Connector => DirentKind::Connector,
            Protocol::File => DirentKind::File,
            Protocol::Directory => DirentKind::Directory,
            Protocol::Device => DirentKind::Device,
            Protocol::Tty => DirentKind::Tty,
            Protocol::Pipe => DirentKind::Pipe,
            Protocol::Memory => DirentKind::Memory,
        }
    }
}

/// One decoded directory entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u64,
    pub kind: DirentKind,
    pub name: String,
}

/// Appends one encoded entry to `buf` unless doing so would push the buffer
/// past `max_bytes`; the buffer is left untouched in that case and `false`
/// is returned so the producer can stop and hand out what fits.
///
/// Encoding: ino as little-endian u64, kind byte, name length byte, name.
pub fn encode_dirent(
    buf: &mut Vec<u8>,
    max_bytes: u64,
    ino: u64,
    kind: DirentKind,
    name: &str,
) -> bool {
    assert!(name.len() <= MAX_NAME_LEN, "entry name longer than MAX_NAME_LEN: {name:?}");

    let entry_len = std::mem::size_of::<u64>() + 2 * std::mem::size_of::<u8>() + name.len();
    if buf.len() + entry_len > max_bytes as usize {
        return false;
    }

    buf.write_u64::<LittleEndian>(ino).expect("vec writes are infallible");
    buf.push(kind as u8);
    buf.push(name.len() as u8);
    buf.extend_from_slice(name.as_bytes());
    true
}

/// Decodes a full buffer of directory entries.
pub fn decode_dirents(buf: &[u8]) -> Result<Vec<Dirent>> {
    use num_traits::FromPrimitive;

    let mut cursor = std::io::Cursor::new(buf);
    let mut entries = Vec::new();
    while (cursor.position() as usize) < buf.len() {
        let ino = cursor.read_u64::<LittleEndian>().map_err(|_| Status::InvalidArgs)?;
        let kind = cursor.read_u8().map_err(|_| Status::InvalidArgs)?;
        let kind = DirentKind::from_u8(kind).unwrap_or(DirentKind::Unknown);
        let len = cursor.read_u8().map_err(|_| Status::InvalidArgs)? as usize;
        let mut name = vec![0; len];
        cursor.read_exact(&mut name).map_err(|_| Status::InvalidArgs)?;
        let name = String::from_utf8(name).map_err(|_| Status::InvalidArgs)?;
        entries.push(Dirent { ino, kind, name });
    }
    Ok(entries)
}
