use crate::dispatch::{Callback, EventDispatcher, EventSource};
use crate::fault_injection::{FaultInjectionStats, FaultInjector};
use crate::scheduler::{Cancel, Scheduler};
use core::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::trace;

/// Non-blocking byte input. Notifies subscribers when more bytes may be readable.
pub trait ByteSource: EventSource {
    /// Read up to `buf.len()` bytes; `0` means "wait for a notification, then retry".
    fn try_read(&self, buf: &mut [u8]) -> usize;
}

/// Non-blocking byte output. Notifies subscribers when more space may be free.
pub trait ByteSink: EventSource {
    /// Write a prefix of `buf`; a short count means "wait for a notification, then retry".
    fn try_write(&self, buf: &[u8]) -> usize;
}

struct PipeShared {
    name: &'static str,
    capacity: usize,
    buffer: RefCell<VecDeque<u8>>,
    readable: EventDispatcher,
    writable: EventDispatcher,
    faults: RefCell<Option<FaultInjector>>,
    bytes_written: Cell<u64>,
    bytes_read: Cell<u64>,
}

impl PipeShared {
    fn append(&self, bytes: &[u8]) {
        let mut faults = self.faults.borrow_mut();
        let mut buffer = self.buffer.borrow_mut();
        match faults.as_mut() {
            Some(injector) => {
                let mut corrupted = Vec::with_capacity(bytes.len());
                injector.corrupt(bytes, &mut corrupted);
                buffer.extend(corrupted);
            }
            None => buffer.extend(bytes.iter().copied()),
        }
    }
}

/// Write end of an in-memory byte pipe.
#[derive(Clone)]
pub struct PipeSink {
    shared: Rc<PipeShared>,
}

/// Read end of an in-memory byte pipe.
#[derive(Clone)]
pub struct PipeSource {
    shared: Rc<PipeShared>,
}

/// A unidirectional, lossless, order-preserving pipe holding at most `capacity` bytes.
///
/// # Panics
/// If `capacity` is zero.
pub fn byte_pipe(sim: &Scheduler, name: &'static str, capacity: usize) -> (PipeSink, PipeSource) {
    assert!(capacity > 0, "pipe {:?} needs a non-zero capacity", name);
    let shared = Rc::new(PipeShared {
        name,
        capacity,
        buffer: RefCell::new(VecDeque::with_capacity(capacity)),
        readable: EventDispatcher::new(sim, "pipe-readable"),
        writable: EventDispatcher::new(sim, "pipe-writable"),
        faults: RefCell::new(None),
        bytes_written: Cell::new(0),
        bytes_read: Cell::new(0),
    });
    (
        PipeSink {
            shared: Rc::clone(&shared),
        },
        PipeSource { shared },
    )
}

impl PipeSink {
    /// Append raw bytes regardless of capacity, bypassing any fault injector.
    pub fn inject(&self, raw: &[u8]) {
        trace!(pipe = self.shared.name, len = raw.len(), "raw injection");
        self.shared.buffer.borrow_mut().extend(raw.iter().copied());
        self.shared.readable.dispatch_later();
    }

    /// Corrupt every byte written from now on through `injector`.
    pub fn attach_faults(&self, injector: FaultInjector) {
        *self.shared.faults.borrow_mut() = Some(injector);
    }

    /// Switch the attached injector on or off. Returns `false` when none is attached.
    pub fn set_faults_enabled(&self, enabled: bool) -> bool {
        match self.shared.faults.borrow_mut().as_mut() {
            Some(injector) => {
                injector.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn fault_stats(&self) -> Option<FaultInjectionStats> {
        self.shared
            .faults
            .borrow()
            .as_ref()
            .map(|injector| injector.get_stats().clone())
    }

    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.get()
    }
}

impl PipeSource {
    pub fn available(&self) -> usize {
        self.shared.buffer.borrow().len()
    }

    pub fn bytes_read(&self) -> u64 {
        self.shared.bytes_read.get()
    }
}

impl EventSource for PipeSink {
    fn subscribe(&self, callback: Callback) -> Cancel {
        self.shared.writable.subscribe(callback)
    }
}

impl ByteSink for PipeSink {
    fn try_write(&self, buf: &[u8]) -> usize {
        let space = self
            .shared
            .capacity
            .saturating_sub(self.shared.buffer.borrow().len());
        let count = space.min(buf.len());
        if count == 0 {
            return 0;
        }
        self.shared.append(&buf[..count]);
        self.shared
            .bytes_written
            .set(self.shared.bytes_written.get() + count as u64);
        self.shared.readable.dispatch_later();
        count
    }
}

impl EventSource for PipeSource {
    fn subscribe(&self, callback: Callback) -> Cancel {
        self.shared.readable.subscribe(callback)
    }
}

impl ByteSource for PipeSource {
    fn try_read(&self, buf: &mut [u8]) -> usize {
        let mut buffer = self.shared.buffer.borrow_mut();
        let count = buf.len().min(buffer.len());
        if count == 0 {
            return 0;
        }
        for (slot, byte) in buf.iter_mut().zip(buffer.drain(..count)) {
            *slot = byte;
        }
        drop(buffer);
        self.shared
            .bytes_read
            .set(self.shared.bytes_read.get() + count as u64);
        self.shared.writable.dispatch_later();
        count
    }
}
