//! The async-wait primitive underlying a connection's dispatch loop.
//!
//! A [`Binding`] couples a connection to one wait over its channel.  The
//! teardown signal is folded into the same wait as inbound traffic, so a
//! teardown request can never be missed or reordered relative to messages.
//!
//! Replies go out through a [`Responder`], which owns its own sender
//! handle: a reply already in flight is deliverable even while the
//! connection that produced it is being torn down.

use std::sync::Arc;

use log::debug;
use tokio::sync::watch;

use crate::transport::{Channel, ChannelSender};
use crate::wire::{Message, Response};

/// What the wait produced.
pub(crate) enum PumpEvent {
    Message(Message),
    PeerClosed,
    Teardown,
}

pub(crate) struct Binding {
    channel: Arc<Channel>,
    teardown: watch::Receiver<bool>,
}

impl Binding {
    pub(crate) fn new(channel: Channel, teardown: watch::Receiver<bool>) -> Binding {
        Binding { channel: Arc::new(channel), teardown }
    }

    /// Waits for the next inbound message, the peer going away, or the
    /// teardown signal, whichever fires first.
    pub(crate) async fn next_event(&mut self) -> PumpEvent {
        if *self.teardown.borrow() {
            return PumpEvent::Teardown;
        }
        tokio::select! {
            _ = self.teardown.changed() => PumpEvent::Teardown,
            msg = self.channel.recv() => match msg {
                Some(msg) => PumpEvent::Message(msg),
                None => PumpEvent::PeerClosed,
            },
        }
    }

    /// Resolves once teardown has been signalled.  Used to abandon long
    /// waits, such as a blocked lock acquisition.
    pub(crate) async fn torn_down(&mut self) {
        if *self.teardown.borrow() {
            return;
        }
        let _ = self.teardown.changed().await;
    }

    /// A reply handle for one transaction.
    pub(crate) fn responder(&self, txid: u64) -> Responder {
        Responder { txid, sender: self.channel.sender() }
    }
}

/// One pending reply, decoupled from the connection's lifetime.
pub(crate) struct Responder {
    txid: u64,
    sender: ChannelSender,
}

impl Responder {
    pub(crate) fn send(self, resp: Response) {
        if self.sender.send(Message::response(self.txid, resp)).is_err() {
            debug!("reply for txid {} dropped, peer is gone", self.txid);
        }
    }
}
