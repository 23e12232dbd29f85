//! Multi-channel message queue (§4.4).
//!
//! Channel 0 is the queue's shared channel — listened to by every side
//! channel in addition to that channel's own slot, with the side channel
//! preferred when both have something waiting. `Hub` instantiates this
//! twice with different roles: `for_workers` uses channel 0 for hub→worker
//! fan-out and direct messages on side channels 1..N (one per registered
//! worker); `for_hub` has no side channels and uses channel 0 as the
//! workers' shared inbox to the hub.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use hive_core::DomainId;
use hive_core::Value;

use crate::error::{Error, Result};

/// What kind of exchange an [`Item`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// A value pushed with no expectation of a reply.
    Broadcast,
    /// Expects a matching `Response` with the same `id`.
    Request,
    /// Answers a prior `Request` with the same `id`.
    Response,
}

/// One entry on a channel.
#[derive(Debug, Clone)]
pub struct Item {
    pub kind: ItemKind,
    pub sender: DomainId,
    /// Correlation id. `0` for items that never expect a reply.
    pub id: u64,
    pub payload: Value,
    /// Set on a `Response` that carries a worker-reported failure instead
    /// of a value.
    pub is_error: bool,
}

impl Item {
    pub fn broadcast(sender: DomainId, payload: Value) -> Self {
        Item { kind: ItemKind::Broadcast, sender, id: 0, payload, is_error: false }
    }

    pub fn request(sender: DomainId, id: u64, payload: Value) -> Self {
        Item { kind: ItemKind::Request, sender, id, payload, is_error: false }
    }

    pub fn response(sender: DomainId, id: u64, payload: Value, is_error: bool) -> Self {
        Item { kind: ItemKind::Response, sender, id, payload, is_error }
    }
}

struct Inner {
    channels: Vec<VecDeque<Item>>,
    closed: bool,
}

/// A FIFO with one shared channel (index 0) and up to `max_side_channels`
/// additional private channels, allocated on demand via [`add_channel`].
///
/// [`add_channel`]: MultiChannelQueue::add_channel
pub struct MultiChannelQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    max_side_channels: usize,
}

impl MultiChannelQueue {
    pub fn new(max_side_channels: usize) -> Self {
        MultiChannelQueue {
            inner: Mutex::new(Inner { channels: vec![VecDeque::new()], closed: false }),
            not_empty: Condvar::new(),
            max_side_channels,
        }
    }

    /// Allocate the next side channel, returning its index (never 0).
    pub fn add_channel(&self) -> Result<usize> {
        let mut g = self.inner.lock();
        if g.channels.len() - 1 >= self.max_side_channels {
            return Err(Error::CapacityExceeded);
        }
        g.channels.push(VecDeque::new());
        let idx = g.channels.len() - 1;
        trace!(channel = idx, "allocated side channel");
        Ok(idx)
    }

    pub fn side_channel_count(&self) -> usize {
        self.inner.lock().channels.len() - 1
    }

    /// Enqueue `item` on `channel` (0 is always valid).
    pub fn put(&self, channel: usize, item: Item) -> Result<()> {
        let mut g = self.inner.lock();
        if g.closed {
            return Err(Error::ClosedQueue);
        }
        g.channels[channel].push_back(item);
        self.not_empty.notify_all();
        Ok(())
    }

    /// Enqueue one independently-built item per side channel, so every
    /// listener sees exactly one copy.
    pub fn broadcast(&self, mut make_item: impl FnMut() -> Item) -> Result<usize> {
        let mut g = self.inner.lock();
        if g.closed {
            return Err(Error::ClosedQueue);
        }
        let n = g.channels.len() - 1;
        for ch in 1..=n {
            g.channels[ch].push_back(make_item());
        }
        self.not_empty.notify_all();
        Ok(n)
    }

    /// Block until an item is available on `channel` or channel 0, biased
    /// toward `channel`'s own item when both have one. Returns `ClosedQueue`
    /// once the queue is closed and both are drained.
    pub fn listen(&self, channel: usize) -> Result<Item> {
        let mut g = self.inner.lock();
        loop {
            if channel != 0 {
                if let Some(item) = g.channels[channel].pop_front() {
                    return Ok(item);
                }
            }
            if let Some(item) = g.channels[0].pop_front() {
                return Ok(item);
            }
            if g.closed {
                return Err(Error::ClosedQueue);
            }
            self.not_empty.wait(&mut g);
        }
    }

    /// Reject further `put`/`broadcast` calls and wake every blocked
    /// listener so it can observe the close.
    pub fn close(&self) {
        let mut g = self.inner.lock();
        g.closed = true;
        self.not_empty.notify_all();
        debug!("queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Drop everything still queued. Errors if the queue was never closed.
    pub fn destroy(&self) -> Result<()> {
        let mut g = self.inner.lock();
        if !g.closed {
            return Err(Error::ClosedQueue);
        }
        for ch in g.channels.iter_mut() {
            ch.clear();
        }
        Ok(())
    }

    pub fn len(&self, channel: usize) -> usize {
        self.inner.lock().channels[channel].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn dummy(sender: DomainId) -> Item {
        Item::broadcast(sender, Value::Int(1))
    }

    #[test]
    fn side_channel_is_preferred_over_shared_channel() {
        let q = MultiChannelQueue::new(4);
        let ch = q.add_channel().unwrap();
        let domain = DomainId::next();
        q.put(0, dummy(domain)).unwrap();
        q.put(ch, Item::broadcast(domain, Value::Int(2))).unwrap();

        let first = q.listen(ch).unwrap();
        assert!(matches!(first.payload, Value::Int(2)));
        let second = q.listen(ch).unwrap();
        assert!(matches!(second.payload, Value::Int(1)));
    }

    #[test]
    fn broadcast_delivers_exactly_once_per_side_channel() {
        let q = Arc::new(MultiChannelQueue::new(8));
        let domain = DomainId::next();
        let channels: Vec<usize> = (0..3).map(|_| q.add_channel().unwrap()).collect();

        let delivered = q.broadcast(|| Item::broadcast(domain, Value::Int(7))).unwrap();
        assert_eq!(delivered, 3);

        for ch in channels {
            assert_eq!(q.len(ch), 1);
            let item = q.listen(ch).unwrap();
            assert!(matches!(item.payload, Value::Int(7)));
            assert_eq!(q.len(ch), 0);
        }
    }

    #[test]
    fn add_channel_beyond_capacity_errors() {
        let q = MultiChannelQueue::new(1);
        q.add_channel().unwrap();
        assert!(matches!(q.add_channel(), Err(Error::CapacityExceeded)));
    }

    #[test]
    fn closing_wakes_blocked_listener_with_closed_error() {
        let q = Arc::new(MultiChannelQueue::new(2));
        let ch = q.add_channel().unwrap();
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.listen(ch));
        thread::sleep(std::time::Duration::from_millis(20));
        q.close();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(Error::ClosedQueue)));
        assert!(matches!(q.put(0, dummy(DomainId::next())), Err(Error::ClosedQueue)));
    }

    #[test]
    fn destroy_before_close_errors() {
        let q = MultiChannelQueue::new(1);
        assert!(matches!(q.destroy(), Err(Error::ClosedQueue)));
        q.close();
        assert!(q.destroy().is_ok());
    }
}
