//! The time-ordered wake scheduler.
//!
//! Sleepers are `(deadline, ident, Completion)` entries in a hand-rolled
//! indexed min-heap, ordered by deadline with ties broken by insertion
//! order. A driver — a dedicated thread ([`Scheduler::run`] /
//! [`Scheduler::spawn_driver`]) or a private loop on the current thread
//! ([`Scheduler::block_on`]) — pops due entries and fulfils them, resuming
//! each sleeper on whatever thread the driver is.
//!
//! Unlike a timer wheel, the heap supports in-place retiming
//! ([`set_time`](Scheduler::set_time)), which is what makes
//! [`alert`](Scheduler::alert) cheap: an alerted sleeper is not removed, its
//! deadline is just pulled forward to *now*.

use super::clock::{Clock, Ticks};
use crate::alert::{AlertFlag, Ident};
use crate::frame::Prepared;
use crate::outcome::Fault;
use crate::promise::{Completion, Promise};
use core::fmt;
use core::future::Future;
use core::sync::atomic::{AtomicBool, Ordering::{AcqRel, Release}};
use core::task::{Context, Poll};
use core::time::Duration;
use std::pin::pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Wake, Waker};
use std::thread::JoinHandle;

// === the heap ===

struct Entry<T> {
    deadline: Ticks,
    seq: u64,
    ident: Ident,
    payload: T,
}

impl<T> Entry<T> {
    fn key(&self) -> (Ticks, u64) {
        (self.deadline, self.seq)
    }
}

/// A binary min-heap keyed by `(deadline, insertion seq)` with by-ident
/// removal and in-place retiming.
pub(crate) struct TimeHeap<T> {
    entries: Vec<Entry<T>>,
    next_seq: u64,
}

impl<T> TimeHeap<T> {
    const fn new() -> Self {
        TimeHeap {
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, deadline: Ticks, ident: Ident, payload: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry {
            deadline,
            seq,
            ident,
            payload,
        });
        self.sift_up(self.entries.len() - 1);
    }

    fn first_deadline(&self) -> Option<Ticks> {
        self.entries.first().map(|entry| entry.deadline)
    }

    fn pop_first(&mut self) -> Option<(Ident, T)> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let entry = self.entries.pop().expect("heap checked non-empty");
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some((entry.ident, entry.payload))
    }

    fn remove_by_ident(&mut self, ident: Ident) -> Option<T> {
        let pos = self.entries.iter().position(|entry| entry.ident == ident)?;
        let last = self.entries.len() - 1;
        self.entries.swap(pos, last);
        let entry = self.entries.pop().expect("heap checked non-empty");
        if pos < self.entries.len() {
            // The displaced element may need to move either way.
            self.sift_down(pos);
            self.sift_up(pos);
        }
        Some(entry.payload)
    }

    /// Retimes the entry registered under `ident`, restoring the heap shape
    /// by sifting from its current slot.
    fn set_time(&mut self, ident: Ident, deadline: Ticks) -> bool {
        let Some(pos) = self.entries.iter().position(|entry| entry.ident == ident) else {
            return false;
        };
        let earlier = deadline < self.entries[pos].deadline;
        self.entries[pos].deadline = deadline;
        if earlier {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
        true
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[pos].key() < self.entries[parent].key() {
                self.entries.swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;
            if left < len && self.entries[left].key() < self.entries[smallest].key() {
                smallest = left;
            }
            if right < len && self.entries[right].key() < self.entries[smallest].key() {
                smallest = right;
            }
            if smallest == pos {
                return;
            }
            self.entries.swap(pos, smallest);
            pos = smallest;
        }
    }
}

impl<T> fmt::Debug for TimeHeap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeHeap").field("len", &self.len()).finish()
    }
}

// === the scheduler ===

struct SchedCore {
    clock: Clock,
    heap: Mutex<TimeHeap<Completion<()>>>,
    signal: Condvar,
}

/// A time-ordered wake scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedCore>,
}

impl Scheduler {
    /// Returns a scheduler reading time from `clock`.
    pub fn new(clock: Clock) -> Self {
        Scheduler {
            core: Arc::new(SchedCore {
                clock,
                heap: Mutex::new(TimeHeap::new()),
                signal: Condvar::new(),
            }),
        }
    }

    /// Returns a scheduler on the monotonic system clock.
    pub fn system() -> Self {
        Scheduler::new(Clock::system())
    }

    /// The scheduler's clock.
    pub fn clock(&self) -> &Clock {
        &self.core.clock
    }

    /// The current timestamp in ticks.
    pub fn now(&self) -> Ticks {
        self.core.clock.now_ticks()
    }

    fn lock_heap(&self) -> MutexGuard<'_, TimeHeap<Completion<()>>> {
        self.core
            .heap
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleeps until the clock reaches `deadline`.
    ///
    /// Registration happens when the promise is first awaited. `ident` lets
    /// the sleeper be addressed later by [`cancel`](Self::cancel) or
    /// [`set_time`](Self::set_time); pass [`Ident::NONE`] when the sleep
    /// never needs to be found again.
    pub fn sleep_until(&self, deadline: Ticks, ident: Ident) -> Promise<()> {
        let this = self.clone();
        Promise::from_fn(move |completion| {
            if !completion.is_connected() {
                return Prepared::none();
            }
            this.schedule(deadline, ident, completion);
            Prepared::none()
        })
    }

    /// Sleeps for `duration` from now.
    pub fn sleep_for(&self, duration: Duration, ident: Ident) -> Promise<()> {
        let deadline = self.deadline_after(duration);
        self.sleep_until(deadline, ident)
    }

    /// Alert-aware sleep until `deadline`.
    ///
    /// If `flag` is already set at registration, the sleep resolves
    /// immediately instead of registering. Otherwise the entry is filed
    /// under the flag's identity, so [`alert`](Self::alert) can pull its
    /// deadline forward.
    pub fn sleep_until_alertable(&self, flag: &AlertFlag, deadline: Ticks) -> Promise<()> {
        let this = self.clone();
        let flag = flag.clone();
        Promise::from_fn(move |completion| {
            if !completion.is_connected() {
                return Prepared::none();
            }
            {
                let mut heap = this.lock_heap();
                if !flag.is_set() {
                    let earlier = deadline < heap.first_deadline().unwrap_or(Ticks::MAX);
                    heap.push(deadline, flag.ident(), completion);
                    if earlier {
                        this.core.signal.notify_all();
                    }
                    return Prepared::none();
                }
            }
            completion.complete(())
        })
    }

    /// Alert-aware sleep for `duration` from now.
    pub fn sleep_for_alertable(&self, flag: &AlertFlag, duration: Duration) -> Promise<()> {
        let deadline = self.deadline_after(duration);
        self.sleep_until_alertable(flag, deadline)
    }

    fn deadline_after(&self, duration: Duration) -> Ticks {
        self.now()
            .saturating_add(self.core.clock.dur_to_ticks(duration))
    }

    fn schedule(&self, deadline: Ticks, ident: Ident, completion: Completion<()>) {
        trace!(deadline, ?ident, "Scheduler::schedule");
        let mut heap = self.lock_heap();
        let earlier = deadline < heap.first_deadline().unwrap_or(Ticks::MAX);
        heap.push(deadline, ident, completion);
        if earlier {
            // The driver may be waiting on a later deadline.
            self.core.signal.notify_all();
        }
    }

    /// The earliest scheduled deadline, if any sleeper is registered.
    pub fn first_deadline(&self) -> Option<Ticks> {
        self.lock_heap().first_deadline()
    }

    /// Number of registered sleepers.
    pub fn len(&self) -> usize {
        self.lock_heap().len()
    }

    /// Returns `true` if no sleeper is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the earliest entry, handing its completion to the caller.
    pub fn remove_first(&self) -> Option<Completion<()>> {
        self.lock_heap().pop_first().map(|(_, completion)| completion)
    }

    /// Removes the entry registered under `ident`, handing its completion
    /// to the caller.
    pub fn remove_by_ident(&self, ident: Ident) -> Option<Completion<()>> {
        self.lock_heap().remove_by_ident(ident)
    }

    /// Retimes the entry registered under `ident`.
    pub fn set_time(&self, ident: Ident, deadline: Ticks) -> bool {
        let mut heap = self.lock_heap();
        let retimed = heap.set_time(ident, deadline);
        if retimed {
            self.core.signal.notify_all();
        }
        retimed
    }

    /// Cancels the sleep registered under `ident`; the sleeper observes
    /// `Empty` (an [`AwaitError::Cancelled`](crate::AwaitError::Cancelled)).
    pub fn cancel(&self, ident: Ident) -> Prepared {
        match self.remove_by_ident(ident) {
            Some(completion) => completion.cancel(),
            None => Prepared::none(),
        }
    }

    /// Cancels the sleep registered under `ident`, resolving it as if its
    /// deadline had been reached.
    pub fn cancel_complete(&self, ident: Ident) -> Prepared {
        match self.remove_by_ident(ident) {
            Some(completion) => completion.complete(()),
            None => Prepared::none(),
        }
    }

    /// Cancels the sleep registered under `ident` with an error.
    pub fn cancel_fault(&self, ident: Ident, fault: Fault) -> Prepared {
        match self.remove_by_ident(ident) {
            Some(completion) => completion.fail_fault(fault),
            None => Prepared::none(),
        }
    }

    /// Alerts `flag`: sets it and pulls any sleep registered under its
    /// identity forward to *now*, so the driver fires it immediately.
    ///
    /// A sleeper that is not currently registered will observe the set flag
    /// at its next alertable registration instead; either way the alert is
    /// not lost.
    pub fn alert(&self, flag: &AlertFlag) {
        trace!(ident = ?flag.ident(), "Scheduler::alert");
        let now = self.now();
        let mut heap = self.lock_heap();
        flag.set();
        heap.set_time(flag.ident(), now);
        self.core.signal.notify_all();
    }

    /// Wakes the driver so it re-examines the heap and its stop condition.
    pub fn interrupt(&self) {
        drop(self.lock_heap());
        self.core.signal.notify_all();
    }

    /// Fires every entry due at or before `now`, resolving each sleeper,
    /// and returns how many fired.
    ///
    /// This is the manual-time driver: tests advance a test clock and then
    /// call `advance_until` with the new timestamp.
    pub fn advance_until(&self, now: Ticks) -> usize {
        let mut fired = 0;
        loop {
            let due = {
                let mut heap = self.lock_heap();
                match heap.first_deadline() {
                    Some(deadline) if deadline <= now => heap.pop_first(),
                    _ => None,
                }
            };
            match due {
                Some((_, completion)) => {
                    completion.complete(()).resume();
                    fired += 1;
                }
                None => return fired,
            }
        }
    }

    /// Runs the driver loop on the current thread until `stop` is set.
    ///
    /// Due sleepers are resolved (and therefore resumed) on this thread.
    /// Setting `stop` must be followed by [`interrupt`](Self::interrupt) to
    /// take effect promptly.
    pub fn run(&self, stop: &AlertFlag) {
        self.run_with(|completion| completion.complete(()).resume(), stop)
    }

    /// Runs the driver loop, handing each due completion to `executor`
    /// instead of resolving it directly.
    pub fn run_with(&self, mut executor: impl FnMut(Completion<()>), stop: &AlertFlag) {
        let mut heap = self.lock_heap();
        while !stop.is_set() {
            match heap.first_deadline() {
                Some(deadline) => {
                    let now = self.now();
                    if deadline <= now {
                        let (_, completion) =
                            heap.pop_first().expect("deadline implies an entry");
                        drop(heap);
                        executor(completion);
                        heap = self.lock_heap();
                    } else {
                        let timeout = self.core.clock.ticks_to_dur(deadline - now);
                        heap = self
                            .core
                            .signal
                            .wait_timeout(heap, timeout)
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .0;
                    }
                }
                None => {
                    heap = self
                        .core
                        .signal
                        .wait(heap)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    /// Spawns a driver thread; the returned handle stops and joins it on
    /// drop.
    pub fn spawn_driver(&self) -> Driver {
        let scheduler = self.clone();
        let stop = AlertFlag::new();
        let thread = {
            let scheduler = scheduler.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("strand-timer".into())
                .spawn(move || scheduler.run(&stop))
                .expect("failed to spawn timer driver thread")
        };
        Driver {
            scheduler,
            stop,
            thread: Some(thread),
        }
    }

    /// Drives `future` to completion on the current thread, running a
    /// private driver loop while it is pending.
    ///
    /// Sleeps registered with this scheduler fire on this thread between
    /// polls; completions arriving from other threads interrupt the wait.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let signal = Arc::new(BlockSignal {
            woken: AtomicBool::new(true),
            scheduler: self.clone(),
        });
        let waker = Waker::from(signal.clone());
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);

        loop {
            if signal.woken.swap(false, AcqRel) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return output;
                }
                continue;
            }

            let due = {
                let mut heap = self.lock_heap();
                match heap.first_deadline() {
                    Some(deadline) if deadline <= self.now() => heap.pop_first(),
                    _ => None,
                }
            };
            if let Some((_, completion)) = due {
                completion.complete(()).resume();
                continue;
            }

            let heap = self.lock_heap();
            if signal.woken.load(core::sync::atomic::Ordering::Acquire) {
                continue;
            }
            match heap.first_deadline() {
                Some(deadline) => {
                    let now = self.now();
                    if deadline <= now {
                        continue;
                    }
                    let timeout = self.core.clock.ticks_to_dur(deadline - now);
                    drop(
                        self.core
                            .signal
                            .wait_timeout(heap, timeout)
                            .unwrap_or_else(|poisoned| poisoned.into_inner()),
                    );
                }
                None => {
                    drop(
                        self.core
                            .signal
                            .wait(heap)
                            .unwrap_or_else(|poisoned| poisoned.into_inner()),
                    );
                }
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("clock", &self.core.clock)
            .field("sleepers", &self.len())
            .finish()
    }
}

/// Wakes [`Scheduler::block_on`] out of its condvar wait.
struct BlockSignal {
    woken: AtomicBool,
    scheduler: Scheduler,
}

impl Wake for BlockSignal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Release);
        self.scheduler.interrupt();
    }
}

/// Handle to a running driver thread; stops and joins it on drop.
pub struct Driver {
    scheduler: Scheduler,
    stop: AlertFlag,
    thread: Option<JoinHandle<()>>,
}

impl Driver {
    /// Signals the driver to stop and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.set();
        self.scheduler.interrupt();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("running", &self.thread.is_some())
            .finish()
    }
}
