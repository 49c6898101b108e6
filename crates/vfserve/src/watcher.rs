//! Directory-change notification fan-out.
//!
//! A directory node that supports watching embeds a [`WatcherContainer`].
//! Registering a watcher optionally replays the directory's current entries
//! as synthetic `Existing` events, flushed in chunks capped at
//! [`MAX_WATCH_BUFFER`] bytes and terminated by one `Idle` sentinel, before
//! any live mutation event is delivered.
//!
//! A watcher whose peer is gone is removed lazily, during the next
//! notification pass that tries to reach it; there is no separate liveness
//! polling.

use std::io::Read;
use std::sync::Mutex;

use bitflags::bitflags;
use bytes::BufMut;
use byteorder::ReadBytesExt;
use enum_primitive::*;
use slab::Slab;

use crate::error::{Result, Status};
use crate::path::MAX_NAME_LEN;
use crate::transport::ChannelSender;
use crate::wire::{Event, Message};

/// Largest encoded watch-event buffer sent in one message.
pub const MAX_WATCH_BUFFER: usize = 8192;

bitflags! {
    /// Selects which event kinds a watcher wants delivered.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct WatchMask: u32 {
        const ADDED    = 1 << 0;
        const REMOVED  = 1 << 1;
        const EXISTING = 1 << 2;
        const IDLE     = 1 << 3;
    }
}

enum_from_primitive! {
    #[doc = "Event kind byte carried in encoded watch buffers"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum WatchEvent {
        Added    = 1,
        Removed  = 2,
        Existing = 3,
        Idle     = 4,
    }
}

impl WatchEvent {
    pub fn mask(self) -> WatchMask {
        match self {
            WatchEvent::Added => WatchMask::ADDED,
            WatchEvent::Removed => WatchMask::REMOVED,
            WatchEvent::Existing => WatchMask::EXISTING,
            WatchEvent::Idle => WatchMask::IDLE,
        }
    }
}

/// Appends one encoded event to `buf` unless it would exceed `max_bytes`.
///
/// Encoding: event byte, name length byte, name.  The `Idle` sentinel
/// carries an empty name.
pub fn encode_watch_event(buf: &mut Vec<u8>, max_bytes: usize, event: WatchEvent, name: &str) -> bool {
    assert!(name.len() <= MAX_NAME_LEN, "watch event name longer than MAX_NAME_LEN");

    if buf.len() + 2 + name.len() > max_bytes {
        return false;
    }
    buf.put_u8(event as u8);
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    true
}

/// Decodes a watch-event buffer into (event, name) pairs.
pub fn decode_watch_events(buf: &[u8]) -> Result<Vec<(WatchEvent, String)>> {
    use num_traits::FromPrimitive;

    let mut cursor = std::io::Cursor::new(buf);
    let mut events = Vec::new();
    while (cursor.position() as usize) < buf.len() {
        let event = cursor.read_u8().map_err(|_| Status::InvalidArgs)?;
        let event = WatchEvent::from_u8(event).ok_or(Status::InvalidArgs)?;
        let len = cursor.read_u8().map_err(|_| Status::InvalidArgs)? as usize;
        let mut name = vec![0; len];
        cursor.read_exact(&mut name).map_err(|_| Status::InvalidArgs)?;
        events.push((event, String::from_utf8(name).map_err(|_| Status::InvalidArgs)?));
    }
    Ok(events)
}

#[derive(Debug)]
struct Watcher {
    mask: WatchMask,
    sink: ChannelSender,
}

/// Per-directory registry of watcher channels.
#[derive(Debug, Default)]
pub struct WatcherContainer {
    watchers: Mutex<Slab<Watcher>>,
}

impl WatcherContainer {
    pub fn new() -> WatcherContainer {
        WatcherContainer { watchers: Mutex::new(Slab::new()) }
    }

    /// Registers a watcher.  Replay, when requested, happens before this.
    pub fn register(&self, mask: WatchMask, sink: ChannelSender) {
        self.watchers.lock().unwrap().insert(Watcher { mask, sink });
    }

    /// Fans `event` out to every watcher whose mask includes it.  Watchers
    /// whose peer is gone are dropped from the registry in this pass.
    pub fn notify(&self, event: WatchEvent, name: &str) {
        let mut watchers = self.watchers.lock().unwrap();
        let mut dead = Vec::new();
        for (key, watcher) in watchers.iter() {
            if !watcher.mask.contains(event.mask()) {
                continue;
            }
            let mut buf = Vec::new();
            encode_watch_event(&mut buf, MAX_WATCH_BUFFER, event, name);
            if watcher
                .sink
                .send(Message::event(Event::WatchBuffer { events: buf }))
                .is_err()
            {
                dead.push(key);
            }
        }
        for key in dead {
            watchers.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.watchers.lock().unwrap().len()
    }
}

/// Replays `names` to a new watcher as `Existing` events followed by the
/// `Idle` sentinel, flushing whenever a chunk reaches [`MAX_WATCH_BUFFER`].
///
/// Fails with `PeerClosed` when the watcher is already gone, in which case
/// the caller should not register it.
pub(crate) fn replay_existing<'a>(
    sink: &ChannelSender,
    mask: WatchMask,
    names: impl Iterator<Item = &'a str>,
) -> Result<()> {
    let mut buf = Vec::new();
    if mask.contains(WatchMask::EXISTING) {
        for name in names {
            if !encode_watch_event(&mut buf, MAX_WATCH_BUFFER, WatchEvent::Existing, name) {
                let chunk = std::mem::take(&mut buf);
                sink.send(Message::event(Event::WatchBuffer { events: chunk }))?;
                let fits = encode_watch_event(&mut buf, MAX_WATCH_BUFFER, WatchEvent::Existing, name);
                assert!(fits, "single watch event exceeds MAX_WATCH_BUFFER");
            }
        }
    }
    if mask.contains(WatchMask::IDLE) {
        if !encode_watch_event(&mut buf, MAX_WATCH_BUFFER, WatchEvent::Idle, "") {
            let chunk = std::mem::take(&mut buf);
            sink.send(Message::event(Event::WatchBuffer { events: chunk }))?;
            encode_watch_event(&mut buf, MAX_WATCH_BUFFER, WatchEvent::Idle, "");
        }
    }
    if !buf.is_empty() {
        sink.send(Message::event(Event::WatchBuffer { events: buf }))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel;
    use crate::wire::Payload;

    fn drain_events(chan: &crate::transport::Channel) -> Vec<(WatchEvent, String)> {
        let mut out = Vec::new();
        while let Some(msg) = chan.try_recv() {
            match msg.body {
                Payload::Event(Event::WatchBuffer { events }) => {
                    out.extend(decode_watch_events(&events).unwrap());
                }
                other => panic!("unexpected message on watcher channel: {other:?}"),
            }
        }
        out
    }

    #[test]
    fn notify_respects_masks() {
        let container = WatcherContainer::new();
        let (server_a, client_a) = channel();
        let (server_b, client_b) = channel();
        container.register(WatchMask::ADDED, server_a.sender());
        container.register(WatchMask::REMOVED, server_b.sender());

        container.notify(WatchEvent::Added, "new");

        assert_eq!(drain_events(&client_a), vec![(WatchEvent::Added, "new".to_owned())]);
        assert!(drain_events(&client_b).is_empty());
    }

    #[test]
    fn dead_watcher_removed_on_next_pass() {
        let container = WatcherContainer::new();
        let (server, client) = channel();
        container.register(WatchMask::ADDED, server.sender());
        assert_eq!(container.len(), 1);

        drop(client);
        drop(server);
        container.notify(WatchEvent::Added, "x");
        assert_eq!(container.len(), 0);
    }

    #[test]
    fn replay_orders_existing_then_idle() {
        let (server, client) = channel();
        let mask = WatchMask::EXISTING | WatchMask::IDLE;
        replay_existing(&server.sender(), mask, ["a", "b"].into_iter()).unwrap();

        assert_eq!(
            drain_events(&client),
            vec![
                (WatchEvent::Existing, "a".to_owned()),
                (WatchEvent::Existing, "b".to_owned()),
                (WatchEvent::Idle, String::new()),
            ]
        );
    }

    #[test]
    fn replay_chunks_large_listings() {
        let (server, client) = channel();
        let names: Vec<String> = (0..200).map(|i| format!("{i:0>100}")).collect();
        let mask = WatchMask::EXISTING | WatchMask::IDLE;
        replay_existing(&server.sender(), mask, names.iter().map(String::as_str)).unwrap();

        let mut buffers = 0;
        let mut decoded = Vec::new();
        while let Some(msg) = client.try_recv() {
            if let Payload::Event(Event::WatchBuffer { events }) = msg.body {
                assert!(events.len() <= MAX_WATCH_BUFFER);
                buffers += 1;
                decoded.extend(decode_watch_events(&events).unwrap());
            }
        }
        assert!(buffers > 1, "200 hundred-byte names cannot fit one buffer");
        assert_eq!(decoded.len(), 201);
        assert_eq!(decoded.last().unwrap().0, WatchEvent::Idle);
    }
}
