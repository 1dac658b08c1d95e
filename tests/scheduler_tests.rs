use fwsim::dispatch::{EventDispatcher, EventSource};
use fwsim::scheduler::Scheduler;
use fwsim::task::{CoopTask, TaskState};
use fwsim::time::VirtualTime;
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

type FireLog = Rc<RefCell<Vec<(VirtualTime, VirtualTime)>>>;

// Each fired timer logs (expected, actual) and may schedule a follow-up at or after now.
fn schedule_chain(sim: &Scheduler, log: &FireLog, expire_at: VirtualTime, depth: u32) {
    let inner_sim = sim.clone();
    let inner_log = Rc::clone(log);
    sim.set_timer(expire_at, "chain", move || {
        inner_log.borrow_mut().push((expire_at, inner_sim.now()));
        if depth > 0 {
            let offset = inner_sim.rng().gen_range(0..2_000u64);
            let next = inner_sim.now() + Duration::from_nanos(offset);
            schedule_chain(&inner_sim, &inner_log, next, depth - 1);
        }
    });
}

#[test]
fn test_advance_fires_every_due_timer_on_time() {
    let sim = Scheduler::new(42);
    let log: FireLog = Rc::default();
    for _ in 0..50 {
        let at = VirtualTime::from_nanos(sim.rng().gen_range(0..10_000));
        schedule_chain(&sim, &log, at, 4);
    }

    let target = VirtualTime::from_nanos(10_000);
    let next = sim.advance(target);

    let fired = log.borrow();
    assert!(!fired.is_empty());
    for (expected, actual) in fired.iter() {
        assert_eq!(expected, actual);
        assert!(*actual <= target);
    }
    assert!(fired.windows(2).all(|pair| pair[0].1 <= pair[1].1));
    // Whatever is left over is strictly after the target.
    assert!(next.is_never() || next > target);
    assert_eq!(sim.now(), target);
}

#[test]
fn test_same_instant_timers_fire_in_registration_order() {
    let sim = Scheduler::new(0);
    let order = Rc::new(RefCell::new(Vec::new()));
    for id in 0..5 {
        let order = Rc::clone(&order);
        sim.set_timer(VirtualTime::from_micros(3), "tie", move || order.borrow_mut().push(id));
    }
    sim.advance(VirtualTime::from_micros(3));
    assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
}

fn traced_run(seed: u64) -> Vec<(VirtualTime, &'static str)> {
    let sim = Scheduler::with_trace(seed);
    let dispatcher = EventDispatcher::new(&sim, "tick");
    let hits = Rc::new(Cell::new(0u32));
    let h = Rc::clone(&hits);
    dispatcher.subscribe(Rc::new(move || h.set(h.get() + 1)));

    for _ in 0..20 {
        let at = VirtualTime::from_micros(sim.rng().gen_range(0..500));
        let d = dispatcher.clone();
        sim.set_timer(at, "poke", move || d.dispatch_later());
    }
    sim.advance(VirtualTime::from_millis(1));
    sim.trace().into_iter().map(|entry| (entry.time, entry.name)).collect()
}

#[test]
fn test_same_seed_same_firing_sequence() {
    let first = traced_run(7);
    assert_eq!(first, traced_run(7));
    assert_ne!(first, traced_run(8));
}

#[test]
fn test_dispatch_later_debounces() {
    let sim = Scheduler::new(0);
    let dispatcher = EventDispatcher::new(&sim, "debounce");
    let counts: Vec<Rc<Cell<u32>>> = (0..3).map(|_| Rc::new(Cell::new(0))).collect();
    for count in &counts {
        let count = Rc::clone(count);
        dispatcher.subscribe(Rc::new(move || count.set(count.get() + 1)));
    }

    for _ in 0..10 {
        dispatcher.dispatch_later();
    }
    assert!(dispatcher.is_pending());
    sim.advance(VirtualTime::ZERO);

    assert!(!dispatcher.is_pending());
    assert!(counts.iter().all(|count| count.get() == 1));
    assert_eq!(sim.get_stats().total_fired, 1);
}

#[test]
fn test_cancelled_subscriber_is_skipped() {
    let sim = Scheduler::new(0);
    let dispatcher = EventDispatcher::new(&sim, "cancel");
    let hits = Rc::new(Cell::new(0));
    let h = Rc::clone(&hits);
    let cancel = dispatcher.subscribe(Rc::new(move || h.set(h.get() + 1)));

    dispatcher.dispatch_later();
    cancel.cancel();
    sim.advance(VirtualTime::ZERO);
    assert_eq!(hits.get(), 0);
    assert_eq!(dispatcher.subscriber_count(), 0);
}

#[test]
fn test_task_wakes_on_first_of_event_or_deadline() {
    let sim = Scheduler::new(0);
    let event = EventDispatcher::new(&sim, "event");
    let wakes = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&wakes);
    let source = event.clone();
    let task = CoopTask::start(&sim, "waiter", &[], move |ctx| async move {
        for _ in 0..2 {
            let deadline = ctx.now() + Duration::from_millis(5);
            ctx.yield_wait_until(&[&source], deadline).await;
            log.borrow_mut().push(ctx.now());
        }
    });
    task.enter();

    // First round: the event wins.
    sim.advance(VirtualTime::from_millis(1));
    event.dispatch_later();
    sim.advance(VirtualTime::from_millis(2));
    // Second round: the deadline wins.
    sim.advance(VirtualTime::from_millis(20));

    assert_eq!(
        *wakes.borrow(),
        vec![VirtualTime::from_millis(1), VirtualTime::from_millis(6)]
    );
    assert_eq!(task.state(), TaskState::Halted);
    assert_eq!(task.entry_count(), 3);
}
