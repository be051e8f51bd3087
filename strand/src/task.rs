//! Suspendable producer tasks.
//!
//! A [`Task`] wraps a user future in a refcounted cell that also holds the
//! task's rendezvous state, so awaiting a task-backed promise costs one
//! allocation total. The cell's storage is reused across the task's life:
//! first it holds the future, then (once polled to completion) nothing but
//! the published outcome.
//!
//! Tasks begin suspended. Nothing runs until the task is bound — to the
//! promise awaiting it, to an explicit [`Completion`], or to nobody
//! (detached) — and its first resumption is dispatched.

use crate::frame::{self, Frame, Prepared};
use crate::loom::{
    cell::UnsafeCell,
    sync::atomic::{
        AtomicU8,
        Ordering::{AcqRel, Acquire, Release},
    },
};
use crate::outcome::{Fault, Outcome};
use crate::promise::{Completion, CompletionTarget, Promise, PromiseCore, RendezvousCell};
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::task::Wake;

/// A suspended computation producing a `T`.
///
/// Construct one with [`Task::new`] from any `Send` future. A task does not
/// run until started; the usual way to start it is to convert it into a
/// [`Promise`] and await that. [`start`](Task::start) binds an explicit
/// [`Completion`] instead, and [`start_detached`](Task::start_detached) runs
/// it with its result discarded.
///
/// Dropping a `Task` handle starts it detached (side effects still happen);
/// use [`cancel`](Task::cancel) to destroy it without running it.
#[must_use = "dropping a Task starts it detached; call `cancel()` to destroy it"]
pub struct Task<T> {
    core: Option<Arc<dyn TaskCore<T>>>,
}

impl<T: Send + 'static> Task<T> {
    /// Wraps `future` in a new, suspended task.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let cell = Arc::new(TaskCell {
            lifecycle: AtomicU8::new(IDLE),
            cell: RendezvousCell::new(),
            stage: UnsafeCell::new(Stage::Pending(future)),
            binding: UnsafeCell::new(Binding::Unbound),
        });
        Task { core: Some(cell) }
    }

    /// Binds `completion` as the task's result target and returns the
    /// task's initial resumption.
    ///
    /// Dropping the returned [`Prepared`] starts the task immediately;
    /// holding it defers the start.
    pub fn start(mut self, completion: Completion<T>) -> Prepared {
        let core = self.core.take().expect("task already consumed");
        core.bind(Binding::External(completion))
    }

    /// Starts the task with nobody listening; its outcome is discarded.
    pub fn start_detached(mut self) -> Prepared {
        let core = self.core.take().expect("task already consumed");
        core.bind(Binding::Detached)
    }

    /// Destroys the task without running it.
    ///
    /// If a completion was already bound, its drop path resolves the
    /// consumer to `Empty`.
    pub fn cancel(mut self) {
        if let Some(core) = self.core.take() {
            core.destroy();
        }
    }

    pub(crate) fn into_promise(mut self) -> Promise<T> {
        let core = self.core.take().expect("task already consumed");
        Promise::from_core(core.as_promise_core())
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.bind(Binding::Detached).resume();
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("consumed", &self.core.is_none())
            .finish()
    }
}

/// Type-erased handle to a [`TaskCell`].
trait TaskCore<T>: Send + Sync {
    fn bind(self: Arc<Self>, binding: Binding<T>) -> Prepared;
    fn destroy(self: Arc<Self>);
    fn as_promise_core(self: Arc<Self>) -> Arc<dyn PromiseCore<T>>;
}

/// Where a task's output goes when it completes.
enum Binding<T> {
    /// Not yet started.
    Unbound,
    /// Resolve the task cell's own rendezvous (the task is awaited as a
    /// promise).
    SelfCell,
    /// Resolve an external completion.
    External(Completion<T>),
    /// Nobody is listening.
    Detached,
}

/// Storage reused across the task's life.
enum Stage<F: Future> {
    Pending(F),
    Complete,
}

/// Task lifecycle states. Plain values, not bits.
const IDLE: u8 = 0;
const QUEUED: u8 = 1;
const RUNNING: u8 = 2;
/// Running, with a wake received mid-poll; repoll before going idle.
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

struct TaskCell<F: Future> {
    lifecycle: AtomicU8,
    cell: RendezvousCell<F::Output>,
    stage: UnsafeCell<Stage<F>>,
    binding: UnsafeCell<Binding<F::Output>>,
}

impl<F> TaskCell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    /// Polls the stored future once.
    ///
    /// Safety of the pin: the future lives in this refcounted allocation and
    /// is only ever dropped in place (here, on completion, or in the cell's
    /// own drop), never moved.
    fn poll_stage(&self, waker: &Waker) -> Poll<F::Output> {
        let mut cx = Context::from_waker(waker);
        let poll = self.stage.with_mut(|stage| match unsafe { &mut *stage } {
            Stage::Pending(future) => unsafe { Pin::new_unchecked(future) }.poll(&mut cx),
            Stage::Complete => unreachable!("completed task polled again"),
        });
        if poll.is_ready() {
            self.drop_future();
        }
        poll
    }

    /// Drops the stored future in place, before the consumer is resumed.
    fn drop_future(&self) {
        self.stage
            .with_mut(|stage| drop(core::mem::replace(unsafe { &mut *stage }, Stage::Complete)));
    }

    fn take_binding(&self) -> Binding<F::Output> {
        self.binding
            .with_mut(|binding| core::mem::replace(unsafe { &mut *binding }, Binding::Unbound))
    }

    /// Delivers the task's outcome through its binding.
    fn finish(&self, outcome: Outcome<F::Output>) {
        match self.take_binding() {
            Binding::SelfCell => {
                if let Some(waker) = self.cell.fulfill(outcome) {
                    waker.wake();
                }
            }
            Binding::External(completion) => completion.fulfill(outcome).resume(),
            Binding::Detached | Binding::Unbound => {
                if let Outcome::Fault(fault) = outcome {
                    unhandled_fault(fault);
                }
            }
        }
    }
}

impl<F> Frame for TaskCell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn run(self: Arc<Self>) {
        if self
            .lifecycle
            .compare_exchange(QUEUED, RUNNING, AcqRel, Acquire)
            .is_err()
        {
            return;
        }
        trace!(task = ?Arc::as_ptr(&self), "Task::run");
        loop {
            let waker = Waker::from(self.clone());
            let probe: Arc<dyn DetachProbe> = self.clone();
            let _current = CurrentGuard::enter(probe);
            let poll = panic::catch_unwind(AssertUnwindSafe(|| self.poll_stage(&waker)));
            match poll {
                Ok(Poll::Pending) => {
                    match self
                        .lifecycle
                        .compare_exchange(RUNNING, IDLE, AcqRel, Acquire)
                    {
                        Ok(_) => return,
                        Err(_) => {
                            // A wake landed mid-poll; fold NOTIFIED back into
                            // RUNNING and poll again.
                            let notified = self
                                .lifecycle
                                .compare_exchange(NOTIFIED, RUNNING, AcqRel, Acquire);
                            debug_assert!(notified.is_ok());
                            continue;
                        }
                    }
                }
                Ok(Poll::Ready(output)) => {
                    test_debug!(task = ?Arc::as_ptr(&self), "Task::run -> complete");
                    self.lifecycle.store(COMPLETE, Release);
                    self.finish(Outcome::Value(output));
                    return;
                }
                Err(payload) => {
                    self.drop_future();
                    self.lifecycle.store(COMPLETE, Release);
                    self.finish(Outcome::Fault(Fault::from_panic(payload)));
                    return;
                }
            }
        }
    }
}

impl<F> Wake for TaskCell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn wake(self: Arc<Self>) {
        loop {
            match self.lifecycle.load(Acquire) {
                IDLE => {
                    if self
                        .lifecycle
                        .compare_exchange(IDLE, QUEUED, AcqRel, Acquire)
                        .is_ok()
                    {
                        frame::schedule(self);
                        return;
                    }
                }
                RUNNING => {
                    if self
                        .lifecycle
                        .compare_exchange(RUNNING, NOTIFIED, AcqRel, Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }
}

impl<F> TaskCore<F::Output> for TaskCell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn bind(self: Arc<Self>, binding: Binding<F::Output>) -> Prepared {
        self.binding.with_mut(|slot| unsafe { *slot = binding });
        Prepared::from_waker(Waker::from(self))
    }

    fn destroy(self: Arc<Self>) {
        self.lifecycle.store(COMPLETE, Release);
        self.drop_future();
        // Dropping a bound completion (if any) resolves its consumer to
        // Empty through the completion's own drop path.
        drop(self.take_binding());
    }

    fn as_promise_core(self: Arc<Self>) -> Arc<dyn PromiseCore<F::Output>> {
        self
    }
}

impl<F> PromiseCore<F::Output> for TaskCell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn cell(&self) -> &RendezvousCell<F::Output> {
        &self.cell
    }

    fn launch(self: Arc<Self>) -> Prepared {
        self.bind(Binding::SelfCell)
    }

    fn abandon(self: Arc<Self>) {
        // A promise holding a never-started task is dropped: the task is
        // cancelled, not detached. Detaching must be asked for explicitly.
        self.destroy();
    }
}

impl<F> CompletionTarget<F::Output> for TaskCell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn cell(&self) -> &RendezvousCell<F::Output> {
        &self.cell
    }
}

// Safety: the stage and binding slots are accessed only under the lifecycle
// state machine (a single RUNNING owner at a time), and the bind/destroy
// paths run before the first resumption.
unsafe impl<F: Future + Send> Send for TaskCell<F> where F::Output: Send {}
unsafe impl<F: Future + Send> Sync for TaskCell<F> where F::Output: Send {}

// === detached-mode probe ===

trait DetachProbe: Send + Sync {
    fn currently_detached(&self) -> bool;
}

impl<F> DetachProbe for TaskCell<F>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn currently_detached(&self) -> bool {
        // Read-only view of the binding; the probe only runs from inside
        // this task's own poll, which is serialized with bind/finish.
        self.binding.with_mut(|binding| match unsafe { &*binding } {
            Binding::SelfCell => self.cell.is_detached(),
            Binding::External(completion) => !completion.is_connected(),
            Binding::Detached => true,
            Binding::Unbound => false,
        })
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Vec<Arc<dyn DetachProbe>>> = const { RefCell::new(Vec::new()) };
}

struct CurrentGuard;

impl CurrentGuard {
    fn enter(probe: Arc<dyn DetachProbe>) -> Self {
        CURRENT_TASK.with(|stack| stack.borrow_mut().push(probe));
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let _ = CURRENT_TASK.try_with(|stack| stack.borrow_mut().pop());
    }
}

/// An awaitable that reports — without suspending — whether the current
/// task's result still has a consumer.
///
/// Detached producers can use this to skip work that only exists to build
/// the result:
///
/// ```
/// use strand::{is_detached, Task};
///
/// let task = Task::<u64>::new(async {
///     if is_detached().await {
///         // nobody will read the result; stop early
///         return 0;
///     }
///     expensive_computation().await
/// });
/// # async fn expensive_computation() -> u64 { 42 }
/// # task.cancel();
/// ```
///
/// Outside a task, this resolves to `false`.
pub fn is_detached() -> IsDetached {
    IsDetached { _priv: () }
}

/// Future returned by [`is_detached`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
#[derive(Debug)]
pub struct IsDetached {
    _priv: (),
}

impl Future for IsDetached {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let detached = CURRENT_TASK
            .try_with(|stack| {
                stack
                    .borrow()
                    .last()
                    .map(|probe| probe.currently_detached())
            })
            .ok()
            .flatten()
            .unwrap_or(false);
        Poll::Ready(detached)
    }
}

// === unhandled fault hook ===

fn default_unhandled(fault: Fault) {
    eprintln!("strand: fault escaped a detached task: {fault}");
    std::process::abort();
}

static UNHANDLED_HOOK: RwLock<fn(Fault)> = RwLock::new(default_unhandled);

/// Replaces the process-wide hook invoked when a fault escapes a task that
/// has no consumer to deliver it to.
///
/// The default hook logs the fault and aborts. A replacement returning
/// normally suppresses the fault.
pub fn set_unhandled_fault_hook(hook: fn(Fault)) {
    *UNHANDLED_HOOK
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = hook;
}

pub(crate) fn unhandled_fault(fault: Fault) {
    let hook = *UNHANDLED_HOOK
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    hook(fault);
}
