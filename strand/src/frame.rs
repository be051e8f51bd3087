//! Resumable frames, the run-queue trampoline, and [`Prepared`] handles.
//!
//! A *frame* is anything that can receive a resumption signal: a task, a
//! combinator slot, a callback consumer, a parked thread. Frames are
//! expressed as [`Waker`]s built from [`Arc`]ed [`Wake`] implementations, so
//! any frame is interchangeable with any other from a producer's point of
//! view.
//!
//! Producer/consumer hand-offs never resume one another recursively.
//! Instead, frames that represent tasks are pushed onto a thread-local run
//! queue and drained iteratively by the outermost wake — the trampoline.
//! This keeps the native stack bounded by a small constant even when two
//! tasks ping-pong through a shared rendezvous.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Wake, Waker};

/// A frame that can be scheduled on the trampoline.
pub(crate) trait Frame: Send + Sync + 'static {
    /// Runs one resumption of this frame.
    ///
    /// Called with the frame dequeued; `run` may re-enqueue the frame (or any
    /// other frame) by waking it.
    fn run(self: Arc<Self>);
}

thread_local! {
    static RUN_QUEUE: RefCell<VecDeque<Arc<dyn Frame>>> = RefCell::new(VecDeque::new());
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// Schedules `frame` for resumption on the current thread.
///
/// If no trampoline is active on this thread, this call becomes the
/// trampoline: it drains the run queue (including frames enqueued while
/// draining) before returning. If a trampoline is already active further up
/// the stack, the frame is queued and this returns immediately.
pub(crate) fn schedule(frame: Arc<dyn Frame>) {
    let queued = RUN_QUEUE
        .try_with(|queue| queue.borrow_mut().push_back(frame.clone()))
        .is_ok();
    if !queued {
        // Thread-local storage is gone (thread teardown). Run in place; at
        // this point there is no deep producer/consumer chain left to bound.
        frame.run();
        return;
    }

    let already_draining = DRAINING
        .try_with(|flag| flag.replace(true))
        .unwrap_or(false);
    if already_draining {
        return;
    }

    loop {
        let next = RUN_QUEUE
            .try_with(|queue| queue.borrow_mut().pop_front())
            .ok()
            .flatten();
        match next {
            Some(frame) => frame.run(),
            None => break,
        }
    }
    let _ = DRAINING.try_with(|flag| flag.set(false));
}

/// A deferred-resumption token holding at most one frame.
///
/// Dropping a `Prepared` resumes the held frame; [`resume`](Self::resume)
/// does the same explicitly, and [`symmetric_transfer`](Self::symmetric_transfer)
/// extracts the raw [`Waker`] so the caller can dispatch it however it
/// likes. Functions that *might* need to resume somebody return a
/// `Prepared`, leaving the choice of when to the caller.
#[must_use = "dropping a Prepared resumes the held frame immediately"]
#[derive(Default)]
pub struct Prepared(Option<Waker>);

impl Prepared {
    /// Returns an empty handle; resuming it is a no-op.
    pub const fn none() -> Self {
        Prepared(None)
    }

    /// Wraps a waker to be woken on drop.
    pub fn from_waker(waker: Waker) -> Self {
        Prepared(Some(waker))
    }

    /// Returns `true` if a frame is held.
    pub fn is_some(&self) -> bool {
        self.0.is_some()
    }

    /// Resumes the held frame now.
    pub fn resume(self) {
        drop(self)
    }

    /// Takes the held waker out, disarming the drop behavior.
    ///
    /// The caller becomes responsible for waking (or dropping) the returned
    /// waker; dropping a bare [`Waker`] does *not* resume it.
    pub fn symmetric_transfer(&mut self) -> Option<Waker> {
        self.0.take()
    }
}

impl Drop for Prepared {
    fn drop(&mut self) {
        if let Some(waker) = self.0.take() {
            waker.wake();
        }
    }
}

impl From<Waker> for Prepared {
    fn from(waker: Waker) -> Self {
        Prepared::from_waker(waker)
    }
}

impl From<Option<Waker>> for Prepared {
    fn from(waker: Option<Waker>) -> Self {
        Prepared(waker)
    }
}

impl From<()> for Prepared {
    fn from(_: ()) -> Self {
        Prepared::none()
    }
}

impl fmt::Debug for Prepared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Prepared")
            .field(&if self.0.is_some() { "armed" } else { "empty" })
            .finish()
    }
}

/// A frame that unblocks an OS thread when resumed.
///
/// This is the synchronous-wait primitive behind
/// [`Promise::wait`](crate::Promise::wait) and the generator's blocking
/// iterator.
pub(crate) struct Parker {
    signalled: Mutex<bool>,
    condvar: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Parker {
            signalled: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    pub(crate) fn waker(self: &Arc<Self>) -> Waker {
        Waker::from(self.clone())
    }

    /// Blocks until [`wake`](Wake::wake) is called, then resets.
    pub(crate) fn park(&self) {
        let mut signalled = self
            .signalled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*signalled {
            signalled = self
                .condvar
                .wait(signalled)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        *signalled = false;
    }
}

impl Wake for Parker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut signalled = self
            .signalled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *signalled = true;
        self.condvar.notify_all();
    }
}
