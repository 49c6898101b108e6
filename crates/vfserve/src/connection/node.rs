//! The bare node protocol connection.
//!
//! Serves only the common node-level operations: attributes, flags, clone,
//! describe, close.  Used for node-reference handles and for negotiated
//! protocols the framework does not specially model, whose real surface is
//! the node's extension hook.

use async_trait::async_trait;

use super::{Common, ConnectionState, RequestHandler, Responder};
use crate::error::Result;
use crate::wire::Request;

pub(crate) struct NodeConnection {
    common: Common,
}

impl NodeConnection {
    pub(crate) fn new(common: Common) -> NodeConnection {
        NodeConnection { common }
    }
}

#[async_trait]
impl RequestHandler for NodeConnection {
    fn common(&mut self) -> &mut Common {
        &mut self.common
    }

    async fn handle_request(
        &mut self,
        req: Request,
        responder: Responder,
    ) -> Result<ConnectionState> {
        // Everything specific to files or directories lands in the common
        // fallback, which answers BadHandle for operations this connection
        // cannot carry.
        self.common.handle_common(req, responder).await
    }
}
