//! Cooperative tasks: sequential protocol scripts that run inside the event loop.
//!
//! A task body is an `async` block. The driver side ([`CoopTask::enter`]) polls it
//! once; the body runs until it awaits one of the [`TaskContext`] yields, at which
//! point control returns to the driver. Exactly one of the two is runnable at any
//! instant, and nothing here ever runs on another thread.
//!
//! Only the futures returned by [`TaskContext`] may be awaited inside a body. The
//! body is polled with a no-op waker, so any other pending future would never be
//! resumed.

use crate::dispatch::{Callback, EventSource};
use crate::scheduler::{Cancel, Scheduler};
use crate::time::VirtualTime;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use serde::{Deserialize, Serialize};
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Waiting,
    Running,
    Halted,
}

struct TaskShared {
    name: &'static str,
    sim: Scheduler,
    state: Cell<TaskState>,
    body: RefCell<Option<LocalBoxFuture<'static, ()>>>,
    // Wakeups armed by the last yield; torn down on the next entry.
    wakeups: RefCell<Vec<Cancel>>,
    entries: Cell<u64>,
}

/// Driver-side handle of a cooperative task.
///
/// Dropping the handle drops the task; pending wakeups then find nothing to enter.
pub struct CoopTask {
    shared: Rc<TaskShared>,
}

impl CoopTask {
    /// Create a task in the `Waiting` state. The body does not run until the task
    /// is first entered, either explicitly or by one of `initial_events` firing.
    pub fn start<F, Fut>(
        sim: &Scheduler,
        name: &'static str,
        initial_events: &[&dyn EventSource],
        body: F,
    ) -> CoopTask
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let shared = Rc::new_cyclic(|weak: &Weak<TaskShared>| {
            let ctx = TaskContext {
                shared: weak.clone(),
                sim: sim.clone(),
            };
            let future: LocalBoxFuture<'static, ()> = Box::pin(body(ctx));
            TaskShared {
                name,
                sim: sim.clone(),
                state: Cell::new(TaskState::Waiting),
                body: RefCell::new(Some(future)),
                wakeups: RefCell::new(Vec::new()),
                entries: Cell::new(0),
            }
        });

        for source in initial_events {
            let cancel = source.subscribe(wake_callback(Rc::downgrade(&shared)));
            shared.wakeups.borrow_mut().push(cancel);
        }
        CoopTask { shared }
    }

    /// Hand control to the task until it yields or returns. No-op once halted.
    ///
    /// # Panics
    /// If the task is already running (re-entered from its own body).
    pub fn enter(&self) {
        enter(&self.shared);
    }

    pub fn state(&self) -> TaskState {
        self.shared.state.get()
    }

    pub fn is_halted(&self) -> bool {
        self.state() == TaskState::Halted
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// How many times the body has been resumed.
    pub fn entry_count(&self) -> u64 {
        self.shared.entries.get()
    }
}

impl fmt::Debug for CoopTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoopTask")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("entries", &self.entry_count())
            .finish()
    }
}

fn wake_callback(task: Weak<TaskShared>) -> Callback {
    Rc::new(move || {
        if let Some(shared) = task.upgrade() {
            enter(&shared);
        }
    })
}

fn cancel_wakeups(shared: &TaskShared) {
    let wakeups = core::mem::take(&mut *shared.wakeups.borrow_mut());
    for wakeup in wakeups {
        wakeup.cancel();
    }
}

fn enter(shared: &Rc<TaskShared>) {
    match shared.state.get() {
        TaskState::Halted => return,
        TaskState::Running => panic!("cooperative task {:?} entered while already running", shared.name),
        TaskState::Waiting => {}
    }
    cancel_wakeups(shared);

    let Some(mut body) = shared.body.borrow_mut().take() else {
        shared.state.set(TaskState::Halted);
        return;
    };

    shared.state.set(TaskState::Running);
    shared.entries.set(shared.entries.get() + 1);
    trace!(task = shared.name, time = %shared.sim.now(), "task entered");

    let mut cx = Context::from_waker(noop_waker_ref());
    match body.as_mut().poll(&mut cx) {
        Poll::Ready(()) => {
            shared.state.set(TaskState::Halted);
            cancel_wakeups(shared);
            debug!(task = shared.name, time = %shared.sim.now(), "task halted");
        }
        Poll::Pending => {
            *shared.body.borrow_mut() = Some(body);
            shared.state.set(TaskState::Waiting);
        }
    }
}

/// Suspension point returned by the [`TaskContext`] yields. Pending exactly once.
#[must_use = "a yield does nothing unless awaited"]
#[derive(Debug)]
pub struct Yield {
    yielded: bool,
}

impl Future for Yield {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            Poll::Pending
        }
    }
}

/// Task-side handle, passed to the body.
#[derive(Clone)]
pub struct TaskContext {
    shared: Weak<TaskShared>,
    sim: Scheduler,
}

impl TaskContext {
    pub fn sim(&self) -> &Scheduler {
        &self.sim
    }

    pub fn now(&self) -> VirtualTime {
        self.sim.now()
    }

    /// Give control back to the driver; resumes on the next entry, whoever causes it.
    pub fn yield_now(&self) -> Yield {
        Yield { yielded: false }
    }

    /// Yield until any of `sources` notifies.
    pub fn yield_wait(&self, sources: &[&dyn EventSource]) -> Yield {
        for source in sources {
            self.wake_on(*source);
        }
        self.yield_now()
    }

    /// Yield until virtual time reaches `deadline` (immediately if it already has).
    pub fn yield_until(&self, deadline: VirtualTime) -> Yield {
        self.wake_at(deadline);
        self.yield_now()
    }

    /// Yield until any of `sources` notifies or `deadline` is reached, whichever is first.
    pub fn yield_wait_until(&self, sources: &[&dyn EventSource], deadline: VirtualTime) -> Yield {
        for source in sources {
            self.wake_on(*source);
        }
        self.yield_until(deadline)
    }

    fn wake_on(&self, source: &dyn EventSource) {
        let cancel = source.subscribe(wake_callback(self.shared.clone()));
        self.arm(cancel);
    }

    fn wake_at(&self, deadline: VirtualTime) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let deadline = deadline.max(self.sim.now());
        let task = self.shared.clone();
        let cancel = self.sim.set_timer(deadline, shared.name, move || {
            if let Some(shared) = task.upgrade() {
                enter(&shared);
            }
        });
        shared.wakeups.borrow_mut().push(cancel);
    }

    fn arm(&self, cancel: Cancel) {
        match self.shared.upgrade() {
            Some(shared) => shared.wakeups.borrow_mut().push(cancel),
            None => cancel.cancel(),
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.shared.upgrade().map(|shared| shared.name);
        f.debug_struct("TaskContext").field("task", &name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::EventDispatcher;
    use std::time::Duration;

    #[test]
    fn test_task_waits_for_first_entry() {
        let sim = Scheduler::new(0);
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let task = CoopTask::start(&sim, "idle", &[], move |_ctx| async move {
            flag.set(true);
        });
        assert_eq!(task.state(), TaskState::Waiting);
        assert!(!ran.get());

        task.enter();
        assert!(ran.get());
        assert!(task.is_halted());

        // Entering a halted task is a no-op.
        task.enter();
        assert_eq!(task.entry_count(), 1);
    }

    #[test]
    fn test_yield_hands_control_back() {
        let sim = Scheduler::new(0);
        let steps = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&steps);
        let task = CoopTask::start(&sim, "stepper", &[], move |ctx| async move {
            for i in 0..3 {
                log.borrow_mut().push(i);
                ctx.yield_now().await;
            }
        });

        task.enter();
        assert_eq!(*steps.borrow(), vec![0]);
        task.enter();
        task.enter();
        assert_eq!(*steps.borrow(), vec![0, 1, 2]);
        assert_eq!(task.state(), TaskState::Waiting);
        task.enter();
        assert!(task.is_halted());
    }

    #[test]
    fn test_initial_events_start_the_task() {
        let sim = Scheduler::new(0);
        let kick = EventDispatcher::new(&sim, "kick");
        let ran = Rc::new(Cell::new(0));
        let count = Rc::clone(&ran);
        let task = CoopTask::start(&sim, "kicked", &[&kick], move |_ctx| async move {
            count.set(count.get() + 1);
        });

        sim.advance(VirtualTime::from_millis(1));
        assert_eq!(ran.get(), 0);

        kick.dispatch_later();
        sim.advance(VirtualTime::from_millis(2));
        assert_eq!(ran.get(), 1);
        assert!(task.is_halted());
        assert_eq!(kick.subscriber_count(), 0);
    }

    #[test]
    fn test_yield_wait_tears_down_subscriptions() {
        let sim = Scheduler::new(0);
        let event = EventDispatcher::new(&sim, "event");
        let wakes = Rc::new(Cell::new(0));
        let seen = Rc::clone(&wakes);
        let source = event.clone();
        let task = CoopTask::start(&sim, "waiter", &[], move |ctx| async move {
            loop {
                ctx.yield_wait(&[&source]).await;
                seen.set(seen.get() + 1);
            }
        });

        task.enter();
        assert_eq!(event.subscriber_count(), 1);

        for round in 1..=3 {
            event.dispatch_later();
            event.dispatch_later();
            sim.advance(sim.now());
            assert_eq!(wakes.get(), round);
            assert_eq!(event.subscriber_count(), 1);
        }
    }

    #[test]
    fn test_yield_until_wakes_at_deadline() {
        let sim = Scheduler::new(0);
        let woke_at = Rc::new(Cell::new(VirtualTime::NEVER));
        let out = Rc::clone(&woke_at);
        let task = CoopTask::start(&sim, "sleeper", &[], move |ctx| async move {
            let deadline = ctx.now() + Duration::from_millis(7);
            ctx.yield_until(deadline).await;
            out.set(ctx.now());
        });

        task.enter();
        sim.advance(VirtualTime::from_millis(6));
        assert!(woke_at.get().is_never());
        sim.advance(VirtualTime::from_millis(20));
        assert_eq!(woke_at.get(), VirtualTime::from_millis(7));
        assert!(task.is_halted());
    }

    #[test]
    fn test_yield_wait_until_event_cancels_timer() {
        let sim = Scheduler::new(0);
        let event = EventDispatcher::new(&sim, "event");
        let wakes = Rc::new(Cell::new(0));
        let seen = Rc::clone(&wakes);
        let source = event.clone();
        let task = CoopTask::start(&sim, "either", &[], move |ctx| async move {
            loop {
                let deadline = ctx.now() + Duration::from_millis(5);
                ctx.yield_wait_until(&[&source], deadline).await;
                seen.set(seen.get() + 1);
            }
        });

        task.enter();
        sim.advance(VirtualTime::from_millis(1));
        event.dispatch_later();
        sim.advance(VirtualTime::from_millis(1));
        assert_eq!(wakes.get(), 1);

        // The 5 ms timer from the first wait was cancelled; the next one is due at 6 ms.
        sim.advance(VirtualTime::from_millis(5));
        assert_eq!(wakes.get(), 1);
        sim.advance(VirtualTime::from_millis(6));
        assert_eq!(wakes.get(), 2);
    }
}
