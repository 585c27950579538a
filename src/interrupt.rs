use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::scheduler::{PRIORITY_READ, Scheduler, SchedulerInner, Unit, priority16};

#[derive(Clone, Copy)]
struct WaiterHandle {
    unit: Unit,
    seq: u64,
    priority: u16,
}

struct SignalInner {
    sched: Rc<SchedulerInner>,
    triggered: Cell<bool>,
    waiter: Cell<Option<WaiterHandle>>,
}

/// One-shot edge signal with at most one waiter.
///
/// Either a task is suspended on the signal (`waiter` set) or a trigger has
/// been latched (`triggered` set); never both. Triggering with a waiter
/// present schedules that task to resume at the current cycle, which also
/// fences the currently running task's short-circuit window so the wake is
/// cycle-exact.
#[derive(Clone)]
pub struct Signal {
    inner: Rc<SignalInner>,
}

impl Signal {
    pub fn new(sched: &Scheduler) -> Self {
        Self {
            inner: Rc::new(SignalInner {
                sched: Rc::clone(sched.inner()),
                triggered: Cell::new(false),
                waiter: Cell::new(None),
            }),
        }
    }

    /// Fire the signal: resume the waiter if one is suspended, otherwise
    /// latch the trigger for the next await.
    pub fn trigger(&self) {
        // Take the waiter first: the resumed task may immediately wait on
        // this signal again.
        if let Some(w) = self.inner.waiter.take() {
            self.inner.sched.wake(w.unit, w.seq, w.priority);
        } else {
            self.inner.triggered.set(true);
        }
    }

    /// Clear a latched trigger.
    pub fn reset(&self) {
        self.inner.triggered.set(false);
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.get()
    }

    /// Await the signal on behalf of `unit`. Resumes immediately (leaving the
    /// latch set) if the signal already fired.
    pub(crate) fn wait(&self, unit: Unit) -> SignalWait {
        SignalWait {
            signal: Rc::clone(&self.inner),
            unit,
            queued: false,
        }
    }

    pub(crate) fn register_waiter(&self, unit: Unit, seq: u64, priority: u16) {
        debug_assert!(self.inner.waiter.get().is_none(), "signal already has a waiter");
        self.inner.waiter.set(Some(WaiterHandle {
            unit,
            seq,
            priority,
        }));
    }

    pub(crate) fn clear_waiter(&self) {
        self.inner.waiter.set(None);
    }
}

/// Future returned by [`Signal::wait`].
pub(crate) struct SignalWait {
    signal: Rc<SignalInner>,
    unit: Unit,
    queued: bool,
}

impl Future for SignalWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.queued {
            return Poll::Ready(());
        }
        if this.signal.triggered.get() {
            return Poll::Ready(());
        }
        let seq = this.signal.sched.next_seq(this.unit);
        this.signal.waiter.set(Some(WaiterHandle {
            unit: this.unit,
            seq,
            priority: priority16(PRIORITY_READ, this.unit),
        }));
        this.queued = true;
        Poll::Pending
    }
}
