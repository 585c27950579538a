use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::Error;
use crate::interrupt::Signal;

/// Execution units, in tie-break order at a shared cycle.
///
/// The CPU clocks on rising edges and the PPU on falling edges of the master
/// clock, so when two units target the same cycle the lower unit id runs
/// first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Unit {
    Debug = 0,
    Dma = 1,
    Cpu = 2,
    Ppu = 3,
}

pub const PRIORITY_READ: u8 = 0;
/// Reads and writes share one priority slot: the units already clock on
/// opposite edges, so the unit id alone breaks same-cycle ties.
pub const PRIORITY_WRITE: u8 = 0;

const NUM_TASKS: usize = 4;

/// Waits scheduled more than this far ahead trip the wrap guard.
const MAX_WAIT: u32 = 1 << 30;

pub(crate) fn priority16(priority: u8, unit: Unit) -> u16 {
    ((priority as u16) << 8) | unit as u16
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), Error>>>>;

enum Resume {
    /// Poll the task in the given unit's slot, provided `seq` still names its
    /// current suspension.
    Task { unit: Unit, seq: u64 },
    /// Run a deferred piece of work (delayed register latches, timer events).
    Callback(Box<dyn FnOnce()>),
}

struct CycleWait {
    wait_until: u32,
    priority: u16,
    resume: Resume,
}

#[derive(Default)]
struct TaskSlot {
    future: RefCell<Option<TaskFuture>>,
    /// Incremented every time the task suspends; queue entries carry the
    /// value so an entry can never resume anything but the suspension that
    /// created it.
    seq: Cell<u64>,
    failure: RefCell<Option<Error>>,
}

pub(crate) struct SchedulerInner {
    cycle_counter: Cell<u32>,
    current_unit: Cell<Unit>,
    next: Cell<u32>,
    next_priority: Cell<u16>,
    /// Sorted descending by (wrap-aware delta, priority16) from the front;
    /// the due-soonest wait sits at the back. Among equal keys the newest
    /// entry is nearest the back and resumes first.
    queue: RefCell<Vec<CycleWait>>,
    tasks: [TaskSlot; NUM_TASKS],
}

impl SchedulerInner {
    /// Wrap-aware ordering key relative to the current cycle.
    fn key(&self, wait_until: u32, priority: u16) -> (i32, u16) {
        (
            wait_until.wrapping_sub(self.cycle_counter.get()) as i32,
            priority,
        )
    }

    pub(crate) fn next_seq(&self, unit: Unit) -> u64 {
        let slot = &self.tasks[unit as usize];
        let seq = slot.seq.get().wrapping_add(1);
        slot.seq.set(seq);
        seq
    }

    fn push_wait(&self, wait: CycleWait) {
        debug_assert!(
            wait.wait_until.wrapping_sub(self.cycle_counter.get()) < MAX_WAIT,
            "wait target {:#X} is too far past cycle {:#X}",
            wait.wait_until,
            self.cycle_counter.get()
        );

        if self.key(wait.wait_until, wait.priority)
            < self.key(self.next.get(), self.next_priority.get())
        {
            self.next.set(wait.wait_until);
            self.next_priority.set(wait.priority);
        }

        let key = self.key(wait.wait_until, wait.priority);
        let mut queue = self.queue.borrow_mut();
        let pos = queue
            .iter()
            .position(|w| self.key(w.wait_until, w.priority) < key)
            .unwrap_or(queue.len());
        queue.insert(pos, wait);
    }

    /// Resume a suspended task at the current cycle. Tightens the tracked
    /// "next" wait so the unit that is currently running cannot short-circuit
    /// past the wake point.
    pub(crate) fn wake(&self, unit: Unit, seq: u64, priority: u16) {
        self.push_wait(CycleWait {
            wait_until: self.cycle_counter.get(),
            priority,
            resume: Resume::Task { unit, seq },
        });
    }

    fn remove_task_wait(&self, unit: Unit, seq: u64) -> bool {
        let mut queue = self.queue.borrow_mut();
        let pos = queue.iter().position(|w| {
            matches!(&w.resume, Resume::Task { unit: u, seq: s } if *u == unit && *s == seq)
        });
        match pos {
            Some(pos) => {
                queue.remove(pos);
                true
            }
            None => false,
        }
    }

    fn poll_task(&self, unit: Unit) {
        let slot = &self.tasks[unit as usize];
        let mut future = slot.future.borrow_mut();
        let Some(fut) = future.as_mut() else {
            return;
        };
        let mut cx = Context::from_waker(Waker::noop());
        match fut.as_mut().poll(&mut cx) {
            Poll::Pending => {}
            Poll::Ready(result) => {
                *future = None;
                if let Err(e) = result {
                    log::warn!("{unit:?} task stopped: {e}");
                    *slot.failure.borrow_mut() = Some(e);
                }
            }
        }
    }

    fn resume_task(&self, unit: Unit, seq: u64) {
        let slot = &self.tasks[unit as usize];
        if slot.seq.get() != seq {
            debug_assert!(false, "stale queue entry for {unit:?}");
            return;
        }
        self.poll_task(unit);
    }
}

/// The cycle scheduler: one wrapping 32-bit counter of ~4.19 MHz T-cycles and
/// a priority queue of suspended execution units.
///
/// Cloning is cheap and yields a handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                cycle_counter: Cell::new(0),
                current_unit: Cell::new(Unit::Debug),
                next: Cell::new(0),
                next_priority: Cell::new(0),
                queue: RefCell::new(Vec::new()),
                tasks: Default::default(),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<SchedulerInner> {
        &self.inner
    }

    pub fn get_cycle_counter(&self) -> u32 {
        self.inner.cycle_counter.get()
    }

    /// Queue a callback to run once the counter reaches `at`.
    pub fn enqueue(&self, at: u32, unit: Unit, priority: u8, f: impl FnOnce() + 'static) {
        self.inner.push_wait(CycleWait {
            wait_until: at,
            priority: priority16(priority, unit),
            resume: Resume::Callback(Box::new(f)),
        });
    }

    /// Await-able wait of `wait` cycles on behalf of `unit`.
    ///
    /// If the target is due, belongs to the unit that is already running and
    /// is sooner than anything scheduled, the wait short-circuits: the
    /// counter advances and no queue round-trip happens. Back-to-back waits
    /// of one unit therefore run in a single scheduler pop.
    pub fn cycles(&self, unit: Unit, priority: u8, wait: u32) -> Cycles {
        Cycles {
            sched: Rc::clone(&self.inner),
            unit,
            priority,
            wait,
            state: WaitState::Created,
        }
    }

    /// Wait that completes on the cycle target or on `signal`, whichever
    /// fires first. Resolves to `true` iff the signal won.
    pub fn interruptible_cycles(
        &self,
        signal: &Signal,
        unit: Unit,
        priority: u8,
        wait: u32,
    ) -> InterruptibleCycles {
        InterruptibleCycles {
            sched: Rc::clone(&self.inner),
            signal: signal.clone(),
            unit,
            priority,
            wait,
            seq: 0,
            state: WaitState::Created,
        }
    }

    /// Advance the machine by `num_cycles` cycles, resuming every due wait in
    /// (cycle, priority) order. On return the counter has advanced by exactly
    /// `num_cycles`.
    pub fn tick(&self, num_cycles: u32) {
        let inner = &*self.inner;
        let end = inner.cycle_counter.get().wrapping_add(num_cycles);

        loop {
            let top = {
                let mut queue = inner.queue.borrow_mut();
                let now = inner.cycle_counter.get();
                let due = queue.last().is_some_and(|w| {
                    w.wait_until.wrapping_sub(now) as i32 <= end.wrapping_sub(now) as i32
                });
                if due { queue.pop() } else { None }
            };
            let Some(top) = top else {
                break;
            };

            inner.cycle_counter.set(top.wait_until);
            inner.next.set(end);
            inner.next_priority.set(0);
            {
                let queue = inner.queue.borrow();
                let now = inner.cycle_counter.get();
                if let Some(head) = queue.last() {
                    if (head.wait_until.wrapping_sub(now) as i32)
                        < end.wrapping_sub(now) as i32
                    {
                        inner.next.set(head.wait_until);
                        inner.next_priority.set(head.priority);
                    }
                }
            }

            match top.resume {
                Resume::Task { unit, seq } => inner.resume_task(unit, seq),
                Resume::Callback(f) => f(),
            }
        }

        inner.cycle_counter.set(end);
    }

    /// Install a task in `unit`'s slot and run it up to its first suspension.
    pub(crate) fn spawn(
        &self,
        unit: Unit,
        future: impl Future<Output = Result<(), Error>> + 'static,
    ) {
        {
            let slot = &self.inner.tasks[unit as usize];
            *slot.future.borrow_mut() = Some(Box::pin(future));
        }
        self.inner.poll_task(unit);
    }

    /// Take the first recorded task failure, if any.
    pub(crate) fn take_failure(&self) -> Option<Error> {
        for slot in &self.inner.tasks {
            if let Some(e) = slot.failure.borrow_mut().take() {
                return Some(e);
            }
        }
        None
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaitState {
    Created,
    Queued,
    Finished,
}

/// Future returned by [`Scheduler::cycles`].
pub struct Cycles {
    sched: Rc<SchedulerInner>,
    unit: Unit,
    priority: u8,
    wait: u32,
    state: WaitState,
}

impl Future for Cycles {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.state {
            WaitState::Created => {
                let sched = &this.sched;
                let wait_until = sched.cycle_counter.get().wrapping_add(this.wait);
                let priority = priority16(this.priority, this.unit);
                if sched.current_unit.get() == this.unit
                    && sched.key(wait_until, priority)
                        < sched.key(sched.next.get(), sched.next_priority.get())
                {
                    sched.cycle_counter.set(wait_until);
                    this.state = WaitState::Finished;
                    return Poll::Ready(());
                }
                let seq = sched.next_seq(this.unit);
                sched.push_wait(CycleWait {
                    wait_until,
                    priority,
                    resume: Resume::Task {
                        unit: this.unit,
                        seq,
                    },
                });
                this.state = WaitState::Queued;
                Poll::Pending
            }
            WaitState::Queued => {
                this.sched.current_unit.set(this.unit);
                this.state = WaitState::Finished;
                Poll::Ready(())
            }
            WaitState::Finished => Poll::Ready(()),
        }
    }
}

/// Future returned by [`Scheduler::interruptible_cycles`].
pub struct InterruptibleCycles {
    sched: Rc<SchedulerInner>,
    signal: Signal,
    unit: Unit,
    priority: u8,
    wait: u32,
    seq: u64,
    state: WaitState,
}

impl Future for InterruptibleCycles {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();
        match this.state {
            WaitState::Created => {
                let sched = &this.sched;
                let wait_until = sched.cycle_counter.get().wrapping_add(this.wait);
                let priority = priority16(this.priority, this.unit);
                let cycles_ready = sched.current_unit.get() == this.unit
                    && sched.key(wait_until, priority)
                        < sched.key(sched.next.get(), sched.next_priority.get());
                if cycles_ready {
                    sched.cycle_counter.set(wait_until);
                }
                if cycles_ready || this.signal.is_triggered() {
                    // Completed without suspending; counts as the timer side.
                    this.state = WaitState::Finished;
                    return Poll::Ready(false);
                }
                let seq = sched.next_seq(this.unit);
                this.seq = seq;
                sched.push_wait(CycleWait {
                    wait_until,
                    priority,
                    resume: Resume::Task {
                        unit: this.unit,
                        seq,
                    },
                });
                this.signal.register_waiter(this.unit, seq, priority);
                this.state = WaitState::Queued;
                Poll::Pending
            }
            WaitState::Queued => {
                this.signal.clear_waiter();
                this.state = WaitState::Finished;
                if this.sched.remove_task_wait(this.unit, this.seq) {
                    // The timed wait is still queued, so the signal resumed
                    // us; discard the queue entry.
                    Poll::Ready(true)
                } else {
                    this.sched.current_unit.set(this.unit);
                    Poll::Ready(false)
                }
            }
            WaitState::Finished => Poll::Ready(false),
        }
    }
}
