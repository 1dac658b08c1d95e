use crate::time::VirtualTime;
use core::cell::{RefCell, RefMut};
use core::fmt;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::trace;

/// The one random number generator of a simulation run.
pub type SimRng = Xoshiro256StarStar;

/// Undo handle for a timer or subscription.
///
/// Calling [`Cancel::cancel`] after the registration has already gone away (timer
/// fired, subscription removed) does nothing. Dropping the handle without
/// calling it leaves the registration in place.
pub struct Cancel {
    action: Option<Box<dyn FnOnce()>>,
}

impl Cancel {
    pub fn new(action: impl FnOnce() + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    pub fn noop() -> Self {
        Self { action: None }
    }

    pub fn cancel(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl fmt::Debug for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancel")
            .field("armed", &self.action.is_some())
            .finish()
    }
}

/// One fired timer, as recorded by a tracing scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEntry {
    pub time: VirtualTime,
    pub seq: u64,
    pub name: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
    pub currently_scheduled: usize,
}

struct Timer {
    name: &'static str,
    callback: Box<dyn FnOnce()>,
}

struct SchedulerState {
    now: VirtualTime,
    next_seq: u64,
    // Keyed by (expire_at, registration sequence): iteration order is firing order.
    timers: BTreeMap<(VirtualTime, u64), Timer>,
    stats: SchedulerStats,
    trace: Option<Vec<TraceEntry>>,
}

struct SchedulerShared {
    state: RefCell<SchedulerState>,
    rng: RefCell<SimRng>,
}

/// Virtual clock and timer queue; the simulation context handed to every component.
///
/// `Scheduler` is a cheap handle: clones share the same clock, queue and RNG. Only
/// [`Scheduler::advance`] moves time forward.
#[derive(Clone)]
pub struct Scheduler {
    shared: Rc<SchedulerShared>,
}

impl Scheduler {
    pub fn new(seed: u64) -> Self {
        Self::build(seed, None)
    }

    /// Like [`Scheduler::new`], but records every fired timer for later comparison.
    pub fn with_trace(seed: u64) -> Self {
        Self::build(seed, Some(Vec::new()))
    }

    fn build(seed: u64, trace: Option<Vec<TraceEntry>>) -> Self {
        Self {
            shared: Rc::new(SchedulerShared {
                state: RefCell::new(SchedulerState {
                    now: VirtualTime::ZERO,
                    next_seq: 0,
                    timers: BTreeMap::new(),
                    stats: SchedulerStats::default(),
                    trace,
                }),
                rng: RefCell::new(SimRng::seed_from_u64(seed)),
            }),
        }
    }

    pub fn now(&self) -> VirtualTime {
        self.shared.state.borrow().now
    }

    /// The simulation's RNG. Keep the borrow short: holding it across a call
    /// that also draws randomness is a fatal double borrow.
    pub fn rng(&self) -> RefMut<'_, SimRng> {
        self.shared.rng.borrow_mut()
    }

    /// Schedule `callback` to run once the clock reaches `expire_at`.
    ///
    /// # Panics
    /// If `expire_at` is [`VirtualTime::NEVER`] or already in the past.
    pub fn set_timer(
        &self,
        expire_at: VirtualTime,
        name: &'static str,
        callback: impl FnOnce() + 'static,
    ) -> Cancel {
        assert!(!expire_at.is_never(), "timer {:?} scheduled at VirtualTime::NEVER", name);
        let key = {
            let mut state = self.shared.state.borrow_mut();
            assert!(
                expire_at >= state.now,
                "timer {:?} scheduled in the past: {} < {}",
                name,
                expire_at,
                state.now
            );
            let seq = state.next_seq;
            state.next_seq += 1;
            state.timers.insert(
                (expire_at, seq),
                Timer {
                    name,
                    callback: Box::new(callback),
                },
            );
            state.stats.total_scheduled += 1;
            state.stats.currently_scheduled = state.timers.len();
            (expire_at, seq)
        };

        let weak: Weak<SchedulerShared> = Rc::downgrade(&self.shared);
        Cancel::new(move || {
            if let Some(shared) = weak.upgrade() {
                let mut state = shared.state.borrow_mut();
                if state.timers.remove(&key).is_some() {
                    state.stats.total_cancelled += 1;
                    state.stats.currently_scheduled = state.timers.len();
                }
            }
        })
    }

    /// Run `callback` before time advances any further.
    pub fn later(&self, name: &'static str, callback: impl FnOnce() + 'static) -> Cancel {
        self.set_timer(self.now(), name, callback)
    }

    /// Fire every timer due at or before `target`, in `(expire_at, seq)` order,
    /// including timers registered by callbacks along the way, then leave the clock
    /// at `target`. Returns the expiry of the next pending timer, or
    /// [`VirtualTime::NEVER`] if none remain.
    ///
    /// # Panics
    /// If `target` is the sentinel or earlier than [`Scheduler::now`].
    pub fn advance(&self, target: VirtualTime) -> VirtualTime {
        assert!(!target.is_never(), "cannot advance to VirtualTime::NEVER");
        {
            let state = self.shared.state.borrow();
            assert!(
                target >= state.now,
                "cannot advance backward: {} < {}",
                target,
                state.now
            );
        }

        loop {
            let (at, seq, timer) = {
                let mut state = self.shared.state.borrow_mut();
                let ((at, seq), timer) = match state.timers.first_entry() {
                    Some(entry) if entry.key().0 <= target => entry.remove_entry(),
                    _ => break,
                };
                assert!(at >= state.now, "timer queue went backward");
                state.now = at;
                state.stats.total_fired += 1;
                state.stats.currently_scheduled = state.timers.len();
                if let Some(trace) = state.trace.as_mut() {
                    trace.push(TraceEntry {
                        time: at,
                        seq,
                        name: timer.name,
                    });
                }
                (at, seq, timer)
            };
            trace!(time = %at, seq, timer = timer.name, "timer fired");
            (timer.callback)();
        }

        let mut state = self.shared.state.borrow_mut();
        state.now = target;
        state
            .timers
            .keys()
            .next()
            .map_or(VirtualTime::NEVER, |&(at, _)| at)
    }

    pub fn advance_by(&self, offset: Duration) -> VirtualTime {
        self.advance(self.now() + offset)
    }

    /// Expiry of the earliest pending timer, or [`VirtualTime::NEVER`].
    pub fn next_expiry(&self) -> VirtualTime {
        self.shared
            .state
            .borrow()
            .timers
            .keys()
            .next()
            .map_or(VirtualTime::NEVER, |&(at, _)| at)
    }

    pub fn get_stats(&self) -> SchedulerStats {
        self.shared.state.borrow().stats.clone()
    }

    /// Fired-timer log; empty unless built with [`Scheduler::with_trace`].
    pub fn trace(&self) -> Vec<TraceEntry> {
        self.shared.state.borrow().trace.clone().unwrap_or_default()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Scheduler")
            .field("now", &state.now)
            .field("pending", &state.timers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn recorder() -> Rc<RefCell<Vec<&'static str>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn test_scheduler_creation() {
        let sim = Scheduler::new(1);
        assert_eq!(sim.now(), VirtualTime::ZERO);
        assert_eq!(sim.next_expiry(), VirtualTime::NEVER);
        assert_eq!(sim.get_stats().currently_scheduled, 0);
    }

    #[test]
    fn test_timers_fire_in_time_order() {
        let sim = Scheduler::new(1);
        let log = recorder();

        for (ms, name) in [(30, "c"), (10, "a"), (20, "b")] {
            let log = Rc::clone(&log);
            sim.set_timer(VirtualTime::from_millis(ms), name, move || log.borrow_mut().push(name));
        }

        let next = sim.advance(VirtualTime::from_millis(15));
        assert_eq!(*log.borrow(), vec!["a"]);
        assert_eq!(next, VirtualTime::from_millis(20));
        assert_eq!(sim.now(), VirtualTime::from_millis(15));

        let next = sim.advance(VirtualTime::from_millis(30));
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert_eq!(next, VirtualTime::NEVER);
    }

    #[test]
    fn test_equal_expiry_fires_in_registration_order() {
        let sim = Scheduler::new(1);
        let log = recorder();
        for name in ["first", "second", "third"] {
            let log = Rc::clone(&log);
            sim.set_timer(VirtualTime::from_millis(5), name, move || log.borrow_mut().push(name));
        }
        sim.advance(VirtualTime::from_millis(5));
        assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_later_runs_before_time_moves() {
        let sim = Scheduler::new(1);
        let log = recorder();

        let inner_sim = sim.clone();
        let inner_log = Rc::clone(&log);
        sim.set_timer(VirtualTime::from_millis(1), "outer", move || {
            inner_log.borrow_mut().push("outer");
            let nested_log = Rc::clone(&inner_log);
            inner_sim.later("nested", move || nested_log.borrow_mut().push("nested"));
        });
        let tail_log = Rc::clone(&log);
        sim.set_timer(VirtualTime::from_millis(2), "tail", move || tail_log.borrow_mut().push("tail"));

        sim.advance(VirtualTime::from_millis(10));
        assert_eq!(*log.borrow(), vec!["outer", "nested", "tail"]);
    }

    #[test]
    fn test_cancel_before_and_after_firing() {
        let sim = Scheduler::new(1);
        let log = recorder();

        let l1 = Rc::clone(&log);
        let cancelled = sim.set_timer(VirtualTime::from_millis(1), "cancelled", move || l1.borrow_mut().push("cancelled"));
        let l2 = Rc::clone(&log);
        let fired = sim.set_timer(VirtualTime::from_millis(1), "fired", move || l2.borrow_mut().push("fired"));

        cancelled.cancel();
        sim.advance(VirtualTime::from_millis(2));
        fired.cancel();

        assert_eq!(*log.borrow(), vec!["fired"]);
        let stats = sim.get_stats();
        assert_eq!(stats.total_cancelled, 1);
        assert_eq!(stats.total_fired, 1);
    }

    #[test]
    #[should_panic(expected = "VirtualTime::NEVER")]
    fn test_timer_at_never_is_fatal() {
        let sim = Scheduler::new(1);
        sim.set_timer(VirtualTime::NEVER, "bad", || {});
    }

    #[test]
    #[should_panic(expected = "cannot advance backward")]
    fn test_advance_backward_is_fatal() {
        let sim = Scheduler::new(1);
        sim.advance(VirtualTime::from_millis(5));
        sim.advance(VirtualTime::from_millis(4));
    }

    #[test]
    fn test_rng_is_seeded() {
        let a = Scheduler::new(42);
        let b = Scheduler::new(42);
        let xs: Vec<u32> = (0..4).map(|_| a.rng().gen()).collect();
        let ys: Vec<u32> = (0..4).map(|_| b.rng().gen()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_trace_records_firings() {
        let sim = Scheduler::with_trace(7);
        sim.set_timer(VirtualTime::from_millis(2), "two", || {});
        sim.set_timer(VirtualTime::from_millis(1), "one", || {});
        sim.advance(VirtualTime::from_millis(3));

        let names: Vec<_> = sim.trace().iter().map(|e| (e.time, e.name)).collect();
        assert_eq!(
            names,
            vec![(VirtualTime::from_millis(1), "one"), (VirtualTime::from_millis(2), "two")]
        );
    }
}
