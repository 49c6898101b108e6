//! The in-process message channel connections are served over.
//!
//! A [`Channel`] is one end of a bidirectional, message-oriented pipe.
//! Messages are structured values and may themselves carry further
//! [`Channel`] ends, which is how open, clone, watch, and mount requests
//! hand a freshly created connection's server end across the wire.
//!
//! Dropping a `Channel` is observable by the peer: pending and future
//! receives complete with "peer closed", and an idle sender can detect the
//! closure asynchronously.  That is the only out-of-band signal the
//! transport provides; everything else is an ordered message stream.

use futures::Stream;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Result, Status};
use crate::wire::Message;

/// One end of a bidirectional message channel.
#[derive(Debug)]
pub struct Channel {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
}

/// A cloneable write-only handle to a channel.
///
/// Reply and event producers hold one of these rather than the `Channel`
/// itself, so a reply in flight can still be delivered while the owning
/// connection is being torn down.
#[derive(Clone, Debug)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<Message>,
}

/// Creates a connected pair of channel ends.
pub fn channel() -> (Channel, Channel) {
    let (atx, arx) = mpsc::unbounded_channel();
    let (btx, brx) = mpsc::unbounded_channel();
    (
        Channel { tx: atx, rx: Mutex::new(brx) },
        Channel { tx: btx, rx: Mutex::new(arx) },
    )
}

impl Channel {
    /// Sends one message to the peer.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).map_err(|_| Status::PeerClosed)
    }

    /// Receives the next message; `None` when the peer end is gone and the
    /// queue has drained.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Non-blocking receive, used by tests and teardown paths.
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn sender(&self) -> ChannelSender {
        ChannelSender { tx: self.tx.clone() }
    }

    /// Consumes the channel, yielding inbound messages as a stream.  The
    /// write half is dropped, so the peer observes the closure.
    pub fn into_stream(self) -> impl Stream<Item = Message> {
        UnboundedReceiverStream::new(self.rx.into_inner())
    }

    /// Resolves when the peer has dropped its end.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_peer_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ChannelSender {
    pub fn send(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).map_err(|_| Status::PeerClosed)
    }

    /// Resolves when the peer has dropped its end.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_peer_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Payload, Request};

    #[tokio::test]
    async fn round_trip() {
        let (a, b) = channel();
        a.send(Message::request(7, Request::Sync)).unwrap();
        let msg = b.recv().await.unwrap();
        assert_eq!(msg.txid, 7);
        assert!(matches!(msg.body, Payload::Request(Request::Sync)));
    }

    #[tokio::test]
    async fn peer_close_observable() {
        let (a, b) = channel();
        drop(b);
        assert!(a.is_peer_closed());
        assert!(a.send(Message::request(1, Request::Sync)).is_err());
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn queued_messages_survive_sender_drop() {
        let (a, b) = channel();
        a.send(Message::request(1, Request::Sync)).unwrap();
        drop(a);
        assert!(b.recv().await.is_some());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_adapter_drains_and_ends() {
        use tokio_stream::StreamExt;

        let (a, b) = channel();
        a.send(Message::request(1, Request::Sync)).unwrap();
        a.send(Message::request(2, Request::Sync)).unwrap();
        drop(a);

        let txids: Vec<u64> = b.into_stream().map(|m| m.txid).collect().await;
        assert_eq!(txids, [1, 2]);
    }
}
