use crate::dispatch::{Callback, EventDispatcher, EventSource};
use crate::scheduler::{Cancel, Scheduler};
use core::cell::RefCell;
use core::fmt;
use std::rc::Rc;

/// Producer of whole packets. Subscribers hear about new availability.
pub trait PacketSource: EventSource {
    fn has_packet_available(&self) -> bool;
    fn receive_packet(&self) -> Option<Vec<u8>>;
}

/// Consumer of whole packets. Subscribers hear about freed space.
pub trait PacketSink: EventSource {
    fn can_accept_packet(&self) -> bool;

    /// # Panics
    /// Implementations treat a send while `can_accept_packet()` is false as a fatal bug.
    fn send_packet(&self, packet: Vec<u8>);
}

struct QueueShared {
    slot: RefCell<Option<Vec<u8>>>,
    changed: EventDispatcher,
}

/// One-packet hand-off buffer between a packet producer and consumer.
#[derive(Clone)]
pub struct PacketQueue {
    shared: Rc<QueueShared>,
}

impl PacketQueue {
    pub fn new(sim: &Scheduler) -> Self {
        Self {
            shared: Rc::new(QueueShared {
                slot: RefCell::new(None),
                changed: EventDispatcher::new(sim, "packet-queue"),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shared.slot.borrow().is_none()
    }
}

impl EventSource for PacketQueue {
    fn subscribe(&self, callback: Callback) -> Cancel {
        self.shared.changed.subscribe(callback)
    }
}

impl PacketSource for PacketQueue {
    fn has_packet_available(&self) -> bool {
        !self.is_empty()
    }

    fn receive_packet(&self) -> Option<Vec<u8>> {
        let packet = self.shared.slot.borrow_mut().take();
        if packet.is_some() {
            self.shared.changed.dispatch_later();
        }
        packet
    }
}

impl PacketSink for PacketQueue {
    fn can_accept_packet(&self) -> bool {
        self.is_empty()
    }

    fn send_packet(&self, packet: Vec<u8>) {
        let mut slot = self.shared.slot.borrow_mut();
        assert!(slot.is_none(), "packet queue already holds a packet");
        *slot = Some(packet);
        drop(slot);
        self.shared.changed.dispatch_later();
    }
}

impl fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.shared.slot.borrow().as_ref().map(Vec::len);
        f.debug_struct("PacketQueue").field("held", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::VirtualTime;
    use core::cell::Cell;

    #[test]
    fn test_single_slot_hand_off() {
        let sim = Scheduler::new(0);
        let queue = PacketQueue::new(&sim);
        assert!(queue.can_accept_packet());
        assert!(!queue.has_packet_available());
        assert_eq!(queue.receive_packet(), None);

        queue.send_packet(vec![1, 2, 3]);
        assert!(!queue.can_accept_packet());
        assert!(queue.has_packet_available());

        assert_eq!(queue.receive_packet(), Some(vec![1, 2, 3]));
        assert!(queue.can_accept_packet());
    }

    #[test]
    fn test_changes_notify_subscribers() {
        let sim = Scheduler::new(0);
        let queue = PacketQueue::new(&sim);
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        queue.subscribe(Rc::new(move || h.set(h.get() + 1)));

        queue.send_packet(vec![9]);
        sim.advance(VirtualTime::ZERO);
        assert_eq!(hits.get(), 1);

        queue.receive_packet();
        sim.advance(VirtualTime::ZERO);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    #[should_panic(expected = "already holds a packet")]
    fn test_overfill_is_fatal() {
        let sim = Scheduler::new(0);
        let queue = PacketQueue::new(&sim);
        queue.send_packet(vec![1]);
        queue.send_packet(vec![2]);
    }
}
