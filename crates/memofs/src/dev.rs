//! Builtin device nodes.
//!
//! Both declare the file and device protocols; negotiation picks the file
//! protocol for ordinary opens, so reads and writes flow through the
//! regular file connection.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use vfserve::{NodeAttributes, NodeCore, ProtocolSet, Result, Vnode};

/// The data sink: reads hit end-of-file immediately, writes report the
/// full count and discard the bytes.
pub struct NullDevice {
    core: NodeCore,
}

impl NullDevice {
    pub fn new() -> Arc<NullDevice> {
        Arc::new(NullDevice { core: NodeCore::new() })
    }
}

#[async_trait]
impl Vnode for NullDevice {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn protocols(&self) -> ProtocolSet {
        ProtocolSet::FILE | ProtocolSet::DEVICE
    }

    async fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    async fn write_at(&self, _offset: u64, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }

    async fn append(&self, data: &[u8]) -> Result<(usize, u64)> {
        Ok((data.len(), 0))
    }

    async fn truncate(&self, _length: u64) -> Result<()> {
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn get_attrs(&self) -> Result<NodeAttributes> {
        Ok(NodeAttributes { id: self.core.id(), link_count: 1, ..Default::default() })
    }
}

/// The zero source: reads fill the buffer with zeroes, writes report the
/// full count and discard the bytes.
pub struct ZeroDevice {
    core: NodeCore,
}

impl ZeroDevice {
    pub fn new() -> Arc<ZeroDevice> {
        Arc::new(ZeroDevice { core: NodeCore::new() })
    }
}

#[async_trait]
impl Vnode for ZeroDevice {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn protocols(&self) -> ProtocolSet {
        ProtocolSet::FILE | ProtocolSet::DEVICE
    }

    async fn read_at(&self, _offset: u64, buf: &mut [u8]) -> Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    async fn write_at(&self, _offset: u64, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }

    async fn append(&self, data: &[u8]) -> Result<(usize, u64)> {
        Ok((data.len(), 0))
    }

    async fn truncate(&self, _length: u64) -> Result<()> {
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn get_attrs(&self) -> Result<NodeAttributes> {
        Ok(NodeAttributes { id: self.core.id(), link_count: 1, ..Default::default() })
    }
}
