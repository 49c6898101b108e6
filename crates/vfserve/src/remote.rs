//! Remote filesystem hand-off.
//!
//! A directory node can act purely as a mount point: once a
//! [`RemoteHandle`] is attached, every open that reaches the node is
//! forwarded across the mount to the remote filesystem's root, and an
//! unmount request is delivered to the remote endpoint when the mount is
//! uninstalled.

use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};

use crate::client::Client;
use crate::error::{Result, Status};
use crate::rights::OpenOptions;
use crate::transport::Channel;

/// How long an unmount waits for the remote's acknowledgment.
const UNMOUNT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// A connection to a remote filesystem's root directory.
#[derive(Debug)]
pub struct RemoteHandle {
    client: Client,
}

impl RemoteHandle {
    /// Wraps the client end of a channel already served by the remote
    /// filesystem.
    pub fn new(channel: Channel) -> RemoteHandle {
        RemoteHandle { client: Client::new(channel) }
    }

    /// Forwards an open across the mount: the remainder of the path and the
    /// requester's server end travel to the remote root.
    pub fn forward_open(&self, options: OpenOptions, path: &str, object: Channel) -> Result<()> {
        self.client.open_with(options.flags, options.rights, path, object)
    }

    /// Tells the remote filesystem it is being unmounted and waits briefly
    /// for the acknowledgment; a remote that is already gone counts as
    /// acknowledged.
    pub async fn unmount(&self) {
        match tokio::time::timeout(UNMOUNT_ACK_TIMEOUT, self.client.unmount()).await {
            Ok(Ok(())) | Ok(Err(Status::PeerClosed)) => {
                info!("remote filesystem acknowledged unmount");
            }
            Ok(Err(status)) => warn!("remote filesystem refused unmount: {status}"),
            Err(_) => warn!("remote filesystem did not acknowledge unmount in time"),
        }
    }
}

/// Mount-point slot a directory node embeds to become mountable.
///
/// The slot holds at most one remote; attaching over an existing remote
/// answers `AlreadyExists`.
#[derive(Debug, Default)]
pub struct RemoteSlot {
    inner: Mutex<Option<RemoteHandle>>,
}

impl RemoteSlot {
    pub fn new() -> RemoteSlot {
        RemoteSlot::default()
    }

    pub fn attach(&self, remote: RemoteHandle) -> Result<()> {
        let mut slot = self.inner.lock().unwrap();
        if slot.is_some() {
            return Err(Status::AlreadyExists);
        }
        *slot = Some(remote);
        Ok(())
    }

    pub fn detach(&self) -> Option<RemoteHandle> {
        self.inner.lock().unwrap().take()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    /// Forwards an open through the attached remote.
    pub fn forward(&self, options: OpenOptions, path: &str, object: Channel) -> Result<()> {
        match &*self.inner.lock().unwrap() {
            Some(remote) => remote.forward_open(options, path, object),
            None => Err(Status::BadHandle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rights::{OpenFlags, Rights};
    use crate::transport::channel;
    use crate::wire::{Payload, Request};

    #[test]
    fn slot_holds_one_remote() {
        let slot = RemoteSlot::new();
        let (_keep_a, a) = channel();
        let (_keep_b, b) = channel();
        assert!(slot.attach(RemoteHandle::new(a)).is_ok());
        assert_eq!(slot.attach(RemoteHandle::new(b)), Err(Status::AlreadyExists));
        assert!(slot.detach().is_some());
        assert!(!slot.is_attached());
    }

    #[tokio::test]
    async fn forward_sends_open_to_remote_root() {
        let slot = RemoteSlot::new();
        let (remote_server, remote_client) = channel();
        slot.attach(RemoteHandle::new(remote_client)).unwrap();

        let (server_end, _client_end) = channel();
        let options = OpenOptions::new(OpenFlags::empty(), Rights::READ);
        slot.forward(options, "sub/leaf", server_end).unwrap();

        let msg = remote_server.recv().await.unwrap();
        match msg.body {
            Payload::Request(Request::Open { path, rights, .. }) => {
                assert_eq!(path, "sub/leaf");
                assert_eq!(rights, Rights::READ);
            }
            other => panic!("expected a forwarded open, got {other:?}"),
        }
    }
}
