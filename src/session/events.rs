//! Event Delivery
//!
//! Cache-wide notifications (item changes, continuous query matches,
//! callback completions) are published into one shared [`EventHub`]. Each
//! session owns a private [`EventQueue`]; binding the queue to the hub makes it
//! a slave of the hub and returns the [`SlaveId`] used to unbind it later.
//!
//! ```text
//!   store ──publish()──> EventHub ──┬──> EventQueue (client-a) ──> connection a
//!                                   ├──> EventQueue (client-b) ──> connection b
//!                                   └──> ...
//! ```
//!
//! `publish` fans out while holding the hub lock, so every queue receives
//! events in the hub's publish order. Nothing orders one queue against
//! another.

use crate::protocol::Frame;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

/// A notification delivered to connected clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    ItemAdded { key: Bytes },
    ItemUpdated { key: Bytes },
    ItemRemoved { key: Bytes },
    ContinuousQueryMatch { query_id: String, key: Bytes },
    CallbackCompleted { callback_id: i64, key: Bytes },
    CacheCleared,
}

impl CacheEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::ItemAdded { .. } => "ITEM_ADDED",
            CacheEvent::ItemUpdated { .. } => "ITEM_UPDATED",
            CacheEvent::ItemRemoved { .. } => "ITEM_REMOVED",
            CacheEvent::ContinuousQueryMatch { .. } => "CQ_MATCH",
            CacheEvent::CallbackCompleted { .. } => "CALLBACK",
            CacheEvent::CacheCleared => "CLEARED",
        }
    }

    /// Encodes the event as `[EVENT, kind, ...]`.
    pub fn to_frame(&self) -> Frame {
        let mut items = vec![Frame::simple("EVENT"), Frame::simple(self.kind())];
        match self {
            CacheEvent::ItemAdded { key }
            | CacheEvent::ItemUpdated { key }
            | CacheEvent::ItemRemoved { key } => items.push(Frame::bulk(key.clone())),
            CacheEvent::ContinuousQueryMatch { query_id, key } => {
                items.push(Frame::bulk(Bytes::copy_from_slice(query_id.as_bytes())));
                items.push(Frame::bulk(key.clone()));
            }
            CacheEvent::CallbackCompleted { callback_id, key } => {
                items.push(Frame::integer(*callback_id));
                items.push(Frame::bulk(key.clone()));
            }
            CacheEvent::CacheCleared => {}
        }
        Frame::array(items)
    }
}

/// Registration token tying a queue to the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlaveId(u64);

impl fmt::Display for SlaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slave-{}", self.0)
    }
}

/// A session's private, ordered event channel.
///
/// The connection that owns the session takes the receiving half once and
/// drains it; the hub writes through the sending half.
#[derive(Debug)]
pub struct EventQueue {
    sender: mpsc::UnboundedSender<CacheEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<CacheEvent>>>,
}

impl EventQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Hands the consuming half to the caller. Returns `None` after the first call.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<CacheEvent>> {
        self.receiver.lock().take()
    }
}

#[derive(Debug)]
struct Slave {
    client_id: String,
    sender: mpsc::UnboundedSender<CacheEvent>,
}

/// The shared broadcast source.
#[derive(Debug, Default)]
pub struct EventHub {
    slaves: Mutex<HashMap<SlaveId, Slave>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_queue(&self) -> EventQueue {
        EventQueue::new()
    }

    /// Subscribes `queue` to everything published from now on.
    pub fn bind(&self, queue: &EventQueue, client_id: &str) -> SlaveId {
        let id = SlaveId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.slaves.lock().insert(
            id,
            Slave {
                client_id: client_id.to_string(),
                sender: queue.sender.clone(),
            },
        );
        trace!(client_id = %client_id, slave = %id, "Event queue bound");
        id
    }

    /// Removes a slave. Returns `false` if the token was not bound.
    pub fn unbind(&self, slave: SlaveId) -> bool {
        self.slaves.lock().remove(&slave).is_some()
    }

    /// Delivers `event` to every bound queue. Returns the number of queues reached.
    pub fn publish(&self, event: CacheEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut slaves = self.slaves.lock();
        // Queues whose receiver is gone are dropped on the way.
        slaves.retain(|_, slave| slave.sender.send(event.clone()).is_ok());
        slaves.len()
    }

    /// Delivers `event` only to the queues bound for `client_id`.
    pub fn publish_to(&self, client_id: &str, event: CacheEvent) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let slaves = self.slaves.lock();
        slaves
            .values()
            .filter(|slave| slave.client_id == client_id)
            .filter(|slave| slave.sender.send(event.clone()).is_ok())
            .count()
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.lock().len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn added(key: &str) -> CacheEvent {
        CacheEvent::ItemAdded {
            key: Bytes::copy_from_slice(key.as_bytes()),
        }
    }

    #[test]
    fn test_publish_order_per_queue() {
        let hub = EventHub::new();
        let queue = hub.create_queue();
        hub.bind(&queue, "client-a");
        let mut rx = queue.take_receiver().unwrap();

        for i in 0..50 {
            hub.publish(added(&format!("k{}", i)));
        }

        for i in 0..50 {
            assert_eq!(rx.try_recv().unwrap(), added(&format!("k{}", i)));
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unbind_stops_delivery() {
        let hub = EventHub::new();
        let queue = hub.create_queue();
        let slave = hub.bind(&queue, "client-a");
        let mut rx = queue.take_receiver().unwrap();

        hub.publish(added("before"));
        assert!(hub.unbind(slave));
        assert!(!hub.unbind(slave));
        hub.publish(added("after"));

        assert_eq!(rx.try_recv().unwrap(), added("before"));
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.slave_count(), 0);
    }

    #[test]
    fn test_receiver_taken_once() {
        let hub = EventHub::new();
        let queue = hub.create_queue();
        assert!(queue.take_receiver().is_some());
        assert!(queue.take_receiver().is_none());
    }

    #[test]
    fn test_publish_wakes_waiting_receiver() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let hub = EventHub::new();
        let queue = hub.create_queue();
        hub.bind(&queue, "client-a");
        let mut rx = queue.take_receiver().unwrap();

        let mut recv = task::spawn(rx.recv());
        assert_pending!(recv.poll());

        hub.publish(added("k1"));

        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), Some(added("k1")));
    }

    #[test]
    fn test_targeted_publish() {
        let hub = EventHub::new();
        let a = hub.create_queue();
        let b = hub.create_queue();
        hub.bind(&a, "client-a");
        hub.bind(&b, "client-b");
        let mut rx_a = a.take_receiver().unwrap();
        let mut rx_b = b.take_receiver().unwrap();

        let done = CacheEvent::CallbackCompleted {
            callback_id: 9,
            key: Bytes::from("k"),
        };
        assert_eq!(hub.publish_to("client-b", done.clone()), 1);

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), done);
    }

    #[test]
    fn test_closed_queue_is_dropped() {
        let hub = EventHub::new();
        let queue = hub.create_queue();
        hub.bind(&queue, "client-a");
        drop(queue);

        assert_eq!(hub.publish(CacheEvent::CacheCleared), 0);
        assert_eq!(hub.slave_count(), 0);
    }

    #[test]
    fn test_concurrent_publishers_keep_single_order() {
        let hub = Arc::new(EventHub::new());
        let a = hub.create_queue();
        let b = hub.create_queue();
        hub.bind(&a, "client-a");
        hub.bind(&b, "client-b");

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let hub = Arc::clone(&hub);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        hub.publish(added(&format!("t{}-{}", t, i)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let drain = |queue: &EventQueue| {
            let mut rx = queue.take_receiver().unwrap();
            let mut seen = Vec::new();
            while let Ok(event) = rx.try_recv() {
                seen.push(event);
            }
            seen
        };
        let seen_a = drain(&a);
        let seen_b = drain(&b);
        assert_eq!(seen_a.len(), 400);
        // Both queues observe the hub's single publish order.
        assert_eq!(seen_a, seen_b);
    }

    #[test]
    fn test_event_frame() {
        let frame = CacheEvent::ContinuousQueryMatch {
            query_id: "q1".to_string(),
            key: Bytes::from("k"),
        }
        .to_frame();
        assert_eq!(
            frame,
            Frame::array(vec![
                Frame::simple("EVENT"),
                Frame::simple("CQ_MATCH"),
                Frame::bulk(Bytes::from("q1")),
                Frame::bulk(Bytes::from("k")),
            ])
        );
    }
}
