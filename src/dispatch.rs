use crate::scheduler::{Cancel, Scheduler};
use core::cell::{Cell, RefCell};
use core::fmt;
use std::rc::{Rc, Weak};
use tracing::trace;

/// Subscriber callback. Shared so a dispatch pass can run from a snapshot.
pub type Callback = Rc<dyn Fn()>;

/// Anything that can notify interested parties that "something may have changed".
///
/// Notifications are hints: a subscriber must re-check whatever condition it
/// cares about when called.
pub trait EventSource {
    fn subscribe(&self, callback: Callback) -> Cancel;
}

impl<T: EventSource + ?Sized> EventSource for Rc<T> {
    fn subscribe(&self, callback: Callback) -> Cancel {
        (**self).subscribe(callback)
    }
}

struct DispatcherShared {
    name: &'static str,
    sim: Scheduler,
    // Registration order; ids only ever increase.
    subscribers: RefCell<Vec<(u64, Callback)>>,
    next_id: Cell<u64>,
    pending: Cell<bool>,
}

/// Ordered, debounced publish/subscribe.
#[derive(Clone)]
pub struct EventDispatcher {
    shared: Rc<DispatcherShared>,
}

impl EventDispatcher {
    pub fn new(sim: &Scheduler, name: &'static str) -> Self {
        Self {
            shared: Rc::new(DispatcherShared {
                name,
                sim: sim.clone(),
                subscribers: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
                pending: Cell::new(false),
            }),
        }
    }

    /// Call every current subscriber once, in subscription order.
    ///
    /// The pass runs over a snapshot: subscriptions added or cancelled by a
    /// callback take effect from the next pass on.
    pub fn dispatch(&self) {
        let snapshot: Vec<Callback> = self
            .shared
            .subscribers
            .borrow()
            .iter()
            .map(|(_, callback)| Rc::clone(callback))
            .collect();
        trace!(dispatcher = self.shared.name, subscribers = snapshot.len(), "dispatch");
        for callback in snapshot {
            callback();
        }
    }

    /// Schedule a [`dispatch`](Self::dispatch) unless one is already pending.
    pub fn dispatch_later(&self) {
        if self.shared.pending.replace(true) {
            return;
        }
        let weak: Weak<DispatcherShared> = Rc::downgrade(&self.shared);
        self.shared.sim.later(self.shared.name, move || {
            if let Some(shared) = weak.upgrade() {
                shared.pending.set(false);
                EventDispatcher { shared }.dispatch();
            }
        });
    }

    pub fn is_pending(&self) -> bool {
        self.shared.pending.get()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.borrow().len()
    }
}

impl EventSource for EventDispatcher {
    fn subscribe(&self, callback: Callback) -> Cancel {
        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);
        self.shared.subscribers.borrow_mut().push((id, callback));

        let weak = Rc::downgrade(&self.shared);
        Cancel::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.subscribers.borrow_mut().retain(|(sub_id, _)| *sub_id != id);
            }
        })
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("name", &self.shared.name)
            .field("subscribers", &self.subscriber_count())
            .field("pending", &self.is_pending())
            .finish()
    }
}
