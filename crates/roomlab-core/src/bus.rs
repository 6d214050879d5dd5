//! Outbound message throttling.
//!
//! Continuous gestures (drag, scale, wall move) produce a message per frame;
//! broadcasting all of them floods the relay. The queue passes the leading
//! edge of each burst and drops provisional repeats for the same entity
//! until [`BROADCAST_THROTTLE`] has elapsed. Final commits and structural
//! changes (add, remove) always pass.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Minimum gap between provisional broadcasts for one entity.
pub const BROADCAST_THROTTLE: Duration = Duration::from_millis(30);

/// Whether a message is an in-flight preview or a committed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finality {
    Provisional,
    Final,
}

/// Key identifying a coalescing class: message kind plus entity id.
pub type ThrottleKey = (&'static str, String);

/// Messages that can be rate-limited per entity.
///
/// `throttle_key` returns `None` for messages that must never be dropped.
pub trait Throttleable {
    fn throttle_key(&self) -> Option<ThrottleKey>;

    fn finality(&self) -> Finality {
        Finality::Final
    }
}

/// Where outbound mutations go. Hosts inject a real bus when collaborating
/// and [`NoopBus`] when editing solo; callers never hold mutable callback
/// slots.
pub trait MessageBus<M> {
    /// Returns false when the message was dropped (no-op bus, throttled, or
    /// not connected).
    fn publish(&mut self, message: M) -> bool;
}

/// Swallows everything; solo editing.
pub struct NoopBus;

impl<M> MessageBus<M> for NoopBus {
    fn publish(&mut self, _message: M) -> bool {
        false
    }
}

/// Leading-edge throttled outgoing queue.
#[derive(Debug)]
pub struct ThrottledQueue<M> {
    last_sent: HashMap<ThrottleKey, Instant>,
    queue: VecDeque<M>,
}

impl<M> Default for ThrottledQueue<M> {
    fn default() -> Self {
        Self {
            last_sent: HashMap::new(),
            queue: VecDeque::new(),
        }
    }
}

impl<M: Throttleable> ThrottledQueue<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message, subject to throttling. Returns false when the
    /// message was dropped.
    pub fn publish(&mut self, message: M) -> bool {
        self.publish_at(message, Instant::now())
    }

    /// Same as [`publish`](Self::publish) with an explicit clock, so tests
    /// control time.
    pub fn publish_at(&mut self, message: M, now: Instant) -> bool {
        if let Some(key) = message.throttle_key() {
            match message.finality() {
                Finality::Provisional => {
                    if let Some(last) = self.last_sent.get(&key) {
                        if now.duration_since(*last) < BROADCAST_THROTTLE {
                            return false;
                        }
                    }
                    self.last_sent.insert(key, now);
                }
                Finality::Final => {
                    // A commit resets the window so the next gesture's first
                    // frame goes out immediately.
                    self.last_sent.remove(&key);
                }
            }
        }
        self.queue.push_back(message);
        true
    }

    /// Drain all queued messages for sending.
    pub fn take_outgoing(&mut self) -> Vec<M> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<M: Throttleable> MessageBus<M> for ThrottledQueue<M> {
    fn publish(&mut self, message: M) -> bool {
        ThrottledQueue::publish(self, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Move {
        entity: String,
        finality: Finality,
    }

    impl Move {
        fn provisional(entity: &str) -> Self {
            Self {
                entity: entity.into(),
                finality: Finality::Provisional,
            }
        }

        fn committed(entity: &str) -> Self {
            Self {
                entity: entity.into(),
                finality: Finality::Final,
            }
        }
    }

    impl Throttleable for Move {
        fn throttle_key(&self) -> Option<ThrottleKey> {
            Some(("move", self.entity.clone()))
        }

        fn finality(&self) -> Finality {
            self.finality
        }
    }

    #[derive(Debug)]
    struct Structural;

    impl Throttleable for Structural {
        fn throttle_key(&self) -> Option<ThrottleKey> {
            None
        }
    }

    #[test]
    fn test_leading_edge_passes() {
        let mut queue = ThrottledQueue::new();
        let now = Instant::now();
        assert!(queue.publish_at(Move::provisional("a"), now));
        assert!(!queue.publish_at(Move::provisional("a"), now + Duration::from_millis(10)));
        assert!(!queue.publish_at(Move::provisional("a"), now + Duration::from_millis(29)));
        assert_eq!(queue.take_outgoing().len(), 1);
    }

    #[test]
    fn test_window_elapses() {
        let mut queue = ThrottledQueue::new();
        let now = Instant::now();
        assert!(queue.publish_at(Move::provisional("a"), now));
        assert!(queue.publish_at(Move::provisional("a"), now + Duration::from_millis(31)));
        assert_eq!(queue.take_outgoing().len(), 2);
    }

    #[test]
    fn test_entities_throttle_independently() {
        let mut queue = ThrottledQueue::new();
        let now = Instant::now();
        assert!(queue.publish_at(Move::provisional("a"), now));
        assert!(queue.publish_at(Move::provisional("b"), now));
        assert!(!queue.publish_at(Move::provisional("a"), now + Duration::from_millis(5)));
        assert_eq!(queue.take_outgoing().len(), 2);
    }

    #[test]
    fn test_final_always_passes_and_resets() {
        let mut queue = ThrottledQueue::new();
        let now = Instant::now();
        assert!(queue.publish_at(Move::provisional("a"), now));
        assert!(queue.publish_at(Move::committed("a"), now + Duration::from_millis(5)));
        // Window was reset by the commit.
        assert!(queue.publish_at(Move::provisional("a"), now + Duration::from_millis(6)));
        assert_eq!(queue.take_outgoing().len(), 3);
    }

    #[test]
    fn test_unkeyed_messages_never_dropped() {
        let mut queue = ThrottledQueue::new();
        let now = Instant::now();
        assert!(queue.publish_at(Structural, now));
        assert!(queue.publish_at(Structural, now));
        assert_eq!(queue.take_outgoing().len(), 2);
    }

    #[test]
    fn test_noop_bus_drops_everything() {
        let mut bus = NoopBus;
        assert!(!bus.publish(Move::committed("a")));
    }

    #[test]
    fn test_take_outgoing_drains() {
        let mut queue = ThrottledQueue::new();
        queue.publish(Move::committed("a"));
        assert!(!queue.is_empty());
        assert_eq!(queue.take_outgoing().len(), 1);
        assert!(queue.is_empty());
    }
}
