//! One-shot rendezvous promises and the completion capability.
//!
//! A [`Promise<T>`] is the consumer half of a rendezvous: it either already
//! holds an [`Outcome`], or it holds the *producer* that will manufacture one
//! — a suspended [`Task`](crate::Task) or a closure — started lazily on
//! first await. A [`Completion<T>`] is the producer half: the move-only,
//! exactly-once right to resolve a specific promise.
//!
//! Dropping a completion can never strand a consumer: the drop path resolves
//! the promise to [`Outcome::Empty`] (or a fault, when the producer thread is
//! unwinding). Dropping a promise can never strand a producer: the producer
//! is detached and its outcome discarded.

mod cell;

#[cfg(all(test, not(loom)))]
mod tests;

pub(crate) use self::cell::RendezvousCell;

use crate::frame::{Parker, Prepared};
use crate::loom::cell::UnsafeCell;
use crate::outcome::{AwaitError, Fault, Outcome, INVALID_STATE};
use crate::task::Task;
use core::fmt;
use core::future::Future;
use core::mem;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::task::Wake;

/// A producer held by a promise.
///
/// Implemented by the closure cell below and by the task cell in
/// [`crate::task`]. The cell, the producer storage, and the rendezvous state
/// share a single refcounted allocation.
pub(crate) trait PromiseCore<T>: Send + Sync {
    /// The rendezvous this producer resolves.
    fn cell(&self) -> &RendezvousCell<T>;

    /// Launches the producer. Called at most once, after a consumer (or
    /// nobody, for detached launches) is in place.
    fn launch(self: Arc<Self>) -> Prepared;

    /// Discards or detaches a never-launched producer when its promise is
    /// dropped.
    fn abandon(self: Arc<Self>);
}

/// A fulfilment target for a [`Completion`].
pub(crate) trait CompletionTarget<T>: Send + Sync {
    fn cell(&self) -> &RendezvousCell<T>;
}

// === impl Completion ===

/// The exactly-once right to resolve one promise.
///
/// Obtained by producers: a closure passed to [`Promise::from_fn`] receives
/// one, and [`Task::start`](crate::Task::start) binds one. Every way of
/// consuming a `Completion` returns a [`Prepared`] handle for the consumer's
/// resumption, so the producer chooses whether to resume inline, defer, or
/// hand the frame onwards.
#[must_use = "dropping a Completion resolves its promise to Empty"]
pub struct Completion<T> {
    target: Option<Arc<dyn CompletionTarget<T>>>,
}

impl<T> Completion<T> {
    pub(crate) fn new(target: Arc<dyn CompletionTarget<T>>) -> Self {
        Completion {
            target: Some(target),
        }
    }

    /// Resolves the promise with a value.
    pub fn complete(self, value: T) -> Prepared {
        self.fulfill(Outcome::Value(value))
    }

    /// Resolves the promise with a value produced by `factory`.
    ///
    /// The factory runs only if a promise is actually attached, so producers
    /// can skip constructing expensive results in detached mode.
    pub fn complete_with(self, factory: impl FnOnce() -> T) -> Prepared {
        match self.into_target() {
            Some(target) => Prepared::from(target.cell().fulfill(Outcome::Value(factory()))),
            None => Prepared::none(),
        }
    }

    /// Resolves the promise with an error.
    pub fn fail<E>(self, error: E) -> Prepared
    where
        E: Error + Send + Sync + 'static,
    {
        self.fulfill(Outcome::Fault(Fault::new(error)))
    }

    /// Resolves the promise with an already-erased fault.
    pub fn fail_fault(self, fault: Fault) -> Prepared {
        self.fulfill(Outcome::Fault(fault))
    }

    /// Resolves the promise to "no value"; the consumer sees
    /// [`AwaitError::Cancelled`].
    pub fn cancel(self) -> Prepared {
        self.fulfill(Outcome::Empty)
    }

    /// Resolves the promise with a pre-built outcome.
    pub fn fulfill(self, outcome: Outcome<T>) -> Prepared {
        match self.into_target() {
            Some(target) => Prepared::from(target.cell().fulfill(outcome)),
            None => Prepared::none(),
        }
    }

    /// Returns `true` while a consumer may still observe the result.
    ///
    /// When this returns `false` the producer is running detached and may
    /// skip whatever work only existed to build the result.
    pub fn is_connected(&self) -> bool {
        match &self.target {
            Some(target) => !target.cell().is_detached(),
            None => false,
        }
    }

    /// Disarms the drop behavior and returns an inert carrier.
    ///
    /// This exists for transports that need to move the capability through a
    /// context where implicit resolution-on-drop would be wrong; call
    /// [`ReleasedCompletion::rebind`] on the other side to restore it.
    pub fn release(mut self) -> ReleasedCompletion<T> {
        ReleasedCompletion {
            target: self.target.take(),
        }
    }

    fn into_target(mut self) -> Option<Arc<dyn CompletionTarget<T>>> {
        self.target.take()
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            let outcome = if std::thread::panicking() {
                Outcome::Fault(Fault::msg("producer panicked before completing"))
            } else {
                Outcome::Empty
            };
            drop(Prepared::from(target.cell().fulfill(outcome)));
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// A [`Completion`] with the drop-resolution policy disarmed.
///
/// Produced by [`Completion::release`]; holds the underlying promise alive
/// but resolves nothing if dropped.
pub struct ReleasedCompletion<T> {
    target: Option<Arc<dyn CompletionTarget<T>>>,
}

impl<T> ReleasedCompletion<T> {
    /// Restores the capability, including its resolution-on-drop policy.
    pub fn rebind(mut self) -> Completion<T> {
        Completion {
            target: self.target.take(),
        }
    }
}

impl<T> fmt::Debug for ReleasedCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("ReleasedCompletion(..)")
    }
}

// === impl Promise ===

enum PromiseState<T> {
    /// Resolved; the outcome is stored inline.
    Ready(Outcome<T>),
    /// A producer is held but has not been launched.
    Unstarted(Arc<dyn PromiseCore<T>>),
    /// The producer is running and this promise is the registered consumer.
    Started(Arc<dyn PromiseCore<T>>),
    /// The producer is running and an external frame (combinator slot or
    /// callback) is the registered consumer.
    Subscribed(Arc<dyn PromiseCore<T>>),
    /// The outcome has been consumed.
    Taken,
}

/// The future handle: a one-shot rendezvous that starts its producer on
/// first await.
///
/// `Promise<T>` implements [`Future`] with output
/// `Result<T, `[`AwaitError`]`>`. It can also be resolved in place without
/// consuming the outcome ([`has_value`](Self::has_value),
/// [`is_empty`](Self::is_empty)), consumed iterator-style
/// ([`get`](Self::get)), handed to a one-shot callback
/// ([`set_callback`](Self::set_callback)), or awaited synchronously from a
/// plain thread ([`wait`](Self::wait)).
#[must_use = "a promise does nothing until awaited, waited on, or given a callback"]
pub struct Promise<T> {
    state: PromiseState<T>,
}

impl<T> Promise<T> {
    /// A promise resolved to "no value".
    pub fn empty() -> Self {
        Promise {
            state: PromiseState::Ready(Outcome::Empty),
        }
    }

    /// A promise resolved with `value`.
    pub fn from_value(value: T) -> Self {
        Promise {
            state: PromiseState::Ready(Outcome::Value(value)),
        }
    }

    /// A promise resolved with a transported error.
    pub fn from_fault(fault: Fault) -> Self {
        Promise {
            state: PromiseState::Ready(Outcome::Fault(fault)),
        }
    }

    pub(crate) fn from_outcome(outcome: Outcome<T>) -> Self {
        Promise {
            state: PromiseState::Ready(outcome),
        }
    }

    pub(crate) fn from_core(core: Arc<dyn PromiseCore<T>>) -> Self {
        Promise {
            state: PromiseState::Unstarted(core),
        }
    }
}

impl<T: Send + 'static> Promise<T> {
    /// A pending promise whose producer is `producer`.
    ///
    /// The closure runs when the promise is first awaited (or subscribed, or
    /// detached), receiving the [`Completion`] it must eventually resolve.
    /// It may resolve it synchronously, stash it somewhere for later, or
    /// hand it to another thread. Whatever it returns converts into a
    /// [`Prepared`] handle that is resumed by the await machinery.
    pub fn from_fn<F, P>(producer: F) -> Self
    where
        F: FnOnce(Completion<T>) -> P + Send + 'static,
        P: Into<Prepared>,
    {
        let core = Arc::new(CallbackCell {
            cell: RendezvousCell::new(),
            producer: UnsafeCell::new(Some(move |completion: Completion<T>| -> Prepared {
                producer(completion).into()
            })),
        });
        Promise::from_core(core)
    }

    /// A pending promise that runs `task` to produce its value.
    pub fn from_task(task: Task<T>) -> Self {
        task.into_promise()
    }
}

impl<T> Promise<T> {
    /// Returns `true` if awaiting would complete without suspending.
    pub fn is_ready(&self) -> bool {
        match &self.state {
            PromiseState::Ready(_) => true,
            PromiseState::Started(core) | PromiseState::Subscribed(core) => core.cell().is_ready(),
            PromiseState::Unstarted(_) => false,
            PromiseState::Taken => true,
        }
    }

    /// Returns `true` once the producer has been launched.
    pub fn is_started(&self) -> bool {
        !matches!(self.state, PromiseState::Unstarted(_))
    }

    /// Core consumer step: drive the rendezvous, launching the producer on
    /// the first call, and take the outcome once published.
    fn poll_take(&mut self, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
        match mem::replace(&mut self.state, PromiseState::Taken) {
            PromiseState::Ready(outcome) => Poll::Ready(outcome),
            PromiseState::Unstarted(core) => {
                // Register interest before the producer exists, so a
                // synchronous fulfilment cannot slip between the two.
                let registered = core.cell().poll_outcome(cx);
                debug_assert!(registered.is_pending());
                let mut prepared = core.clone().launch();
                if let Some(waker) = prepared.symmetric_transfer() {
                    // A synchronous producer may hand us back our own frame;
                    // resuming ourselves from inside poll would be a wasted
                    // spin through the trampoline.
                    if !waker.will_wake(cx.waker()) {
                        waker.wake();
                    }
                }
                if core.cell().is_ready() {
                    return Poll::Ready(core.cell().take_outcome());
                }
                self.state = PromiseState::Started(core);
                Poll::Pending
            }
            PromiseState::Started(core) => match core.cell().poll_outcome(cx) {
                Poll::Ready(outcome) => Poll::Ready(outcome),
                Poll::Pending => {
                    self.state = PromiseState::Started(core);
                    Poll::Pending
                }
            },
            PromiseState::Subscribed(core) => {
                if core.cell().is_ready() {
                    Poll::Ready(core.cell().take_outcome())
                } else {
                    panic!("{INVALID_STATE}: awaited while another consumer is registered");
                }
            }
            PromiseState::Taken => panic!("{INVALID_STATE}: promise polled after completion"),
        }
    }

    /// Like [`poll_take`](Self::poll_take), but leaves the outcome stored in
    /// the promise so it can be inspected and consumed later.
    fn poll_resolve(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let PromiseState::Ready(_) = self.state {
            return Poll::Ready(());
        }
        match self.poll_take(cx) {
            Poll::Ready(outcome) => {
                self.state = PromiseState::Ready(outcome);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn peek(&self) -> &Outcome<T> {
        match &self.state {
            PromiseState::Ready(outcome) => outcome,
            _ => unreachable!("peeked at an unresolved promise"),
        }
    }

    /// Awaitable predicate: resolves the promise in place and reports
    /// whether it holds a value. The outcome stays stored, so the value can
    /// still be consumed afterwards.
    pub fn has_value(&mut self) -> HasValue<'_, T> {
        HasValue { promise: self }
    }

    /// Awaitable predicate: resolves the promise in place and reports
    /// whether it resolved to "no value".
    pub fn is_empty(&mut self) -> IsEmpty<'_, T> {
        IsEmpty { promise: self }
    }

    /// Consumes the promise, resolving to `Ok(Some(value))`, `Ok(None)` for
    /// the empty outcome, or `Err(fault)` for a transported error.
    ///
    /// This is the iterator-shaped consumption used to drive generators:
    /// "no value" marks the end of the sequence rather than an error.
    pub fn get(self) -> GetValue<T> {
        GetValue { promise: self }
    }

    /// Registers an external consumer frame and launches the producer.
    ///
    /// Returns the producer's initial resumption. Panics if a consumer is
    /// already registered.
    pub(crate) fn subscribe(&mut self, waker: Waker) -> Prepared {
        match mem::replace(&mut self.state, PromiseState::Taken) {
            PromiseState::Ready(outcome) => {
                self.state = PromiseState::Ready(outcome);
                Prepared::from(waker)
            }
            PromiseState::Unstarted(core) => {
                let mut cx = Context::from_waker(&waker);
                let registered = core.cell().poll_outcome(&mut cx);
                debug_assert!(registered.is_pending());
                let prepared = core.clone().launch();
                self.state = PromiseState::Subscribed(core);
                prepared
            }
            PromiseState::Started(_) | PromiseState::Subscribed(_) => {
                panic!("{INVALID_STATE}: a consumer is already registered")
            }
            PromiseState::Taken => panic!("{INVALID_STATE}: promise already consumed"),
        }
    }

    /// Launches the producer with nobody listening and discards the handle.
    ///
    /// The producer runs to completion; its outcome is thrown away.
    pub fn detach(mut self) {
        match mem::replace(&mut self.state, PromiseState::Taken) {
            PromiseState::Unstarted(core) => {
                core.cell().detach();
                core.launch().resume();
            }
            PromiseState::Started(core) => core.cell().detach(),
            PromiseState::Subscribed(_) | PromiseState::Ready(_) | PromiseState::Taken => {}
        }
    }

    /// Registers a one-shot callback invoked with the resolved promise.
    ///
    /// If the promise is already resolved the callback runs immediately.
    /// Otherwise the returned [`Prepared`] handle holds the *producer's*
    /// start: dropping it kicks the producer off at once, and storing it
    /// defers the launch.
    pub fn set_callback<F>(mut self, callback: F) -> Prepared
    where
        F: FnOnce(Promise<T>) + Send + 'static,
        T: Send + 'static,
    {
        match mem::replace(&mut self.state, PromiseState::Taken) {
            PromiseState::Ready(outcome) => {
                callback(Promise::from_outcome(outcome));
                Prepared::none()
            }
            PromiseState::Unstarted(core) => {
                let frame = Arc::new(CallbackFrame {
                    core: core.clone(),
                    callback: Mutex::new(Some(callback)),
                });
                let waker = Waker::from(frame);
                let mut cx = Context::from_waker(&waker);
                let registered = core.cell().poll_outcome(&mut cx);
                debug_assert!(registered.is_pending());
                let launch = Arc::new(LaunchFrame {
                    core: Mutex::new(Some(core.clone())),
                });
                self.state = PromiseState::Subscribed(core);
                Prepared::from_waker(Waker::from(launch))
            }
            PromiseState::Started(_) | PromiseState::Subscribed(_) => {
                panic!("{INVALID_STATE}: a consumer is already registered")
            }
            PromiseState::Taken => panic!("{INVALID_STATE}: promise already consumed"),
        }
    }

    /// Blocks the current OS thread until the promise resolves.
    ///
    /// The producer is launched on this thread; completions arriving from
    /// other threads unpark it.
    pub fn wait(mut self) -> Result<T, AwaitError> {
        let parker = Parker::new();
        let waker = parker.waker();
        let mut cx = Context::from_waker(&waker);
        loop {
            match self.poll_take(&mut cx) {
                Poll::Ready(outcome) => return outcome.into_result(),
                Poll::Pending => parker.park(),
            }
        }
    }
}

impl<T: Default> Default for Promise<T> {
    fn default() -> Self {
        Promise::from_value(T::default())
    }
}

impl<T> From<T> for Promise<T> {
    fn from(value: T) -> Self {
        Promise::from_value(value)
    }
}

impl<T: Send + 'static> From<Task<T>> for Promise<T> {
    fn from(task: Task<T>) -> Self {
        Promise::from_task(task)
    }
}

impl<T> Future for Promise<T> {
    type Output = Result<T, AwaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_take(cx).map(Outcome::into_result)
    }
}

impl<T> Unpin for Promise<T> {}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        match mem::replace(&mut self.state, PromiseState::Taken) {
            // The producer never launched; let it decide whether to cancel
            // (tasks) or run out detached (closures).
            PromiseState::Unstarted(core) => core.abandon(),
            // We are the registered consumer; tell the running producer that
            // nobody is listening any more.
            PromiseState::Started(core) => core.cell().detach(),
            // An external frame is the consumer; it still gets its wake.
            PromiseState::Subscribed(_) => {}
            PromiseState::Ready(_) | PromiseState::Taken => {}
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            PromiseState::Ready(Outcome::Empty) => "Ready(Empty)",
            PromiseState::Ready(Outcome::Value(_)) => "Ready(Value)",
            PromiseState::Ready(Outcome::Fault(_)) => "Ready(Fault)",
            PromiseState::Unstarted(_) => "Unstarted",
            PromiseState::Started(_) => "Started",
            PromiseState::Subscribed(_) => "Subscribed",
            PromiseState::Taken => "Taken",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

// === producer cores ===

/// A closure producer sharing one allocation with its rendezvous cell.
struct CallbackCell<T, F> {
    cell: RendezvousCell<T>,
    producer: UnsafeCell<Option<F>>,
}

impl<T, F> CallbackCell<T, F>
where
    F: FnOnce(Completion<T>) -> Prepared + Send + 'static,
    T: Send + 'static,
{
    fn take_producer(&self) -> Option<F> {
        // The launch/abandon paths run at most once in total (enforced by
        // the promise state machine), so this access is exclusive.
        self.producer.with_mut(|slot| unsafe { (*slot).take() })
    }
}

impl<T, F> PromiseCore<T> for CallbackCell<T, F>
where
    F: FnOnce(Completion<T>) -> Prepared + Send + 'static,
    T: Send + 'static,
{
    fn cell(&self) -> &RendezvousCell<T> {
        &self.cell
    }

    fn launch(self: Arc<Self>) -> Prepared {
        match self.take_producer() {
            Some(producer) => {
                let completion = Completion::new(self);
                producer(completion)
            }
            None => Prepared::none(),
        }
    }

    fn abandon(self: Arc<Self>) {
        // Detached mode: the closure still runs, with a completion nobody is
        // listening to, so side effects are not lost.
        self.cell.detach();
        self.launch().resume();
    }
}

impl<T, F> CompletionTarget<T> for CallbackCell<T, F>
where
    F: FnOnce(Completion<T>) -> Prepared + Send + 'static,
    T: Send + 'static,
{
    fn cell(&self) -> &RendezvousCell<T> {
        &self.cell
    }
}

// Safety: the producer slot is accessed exclusively by the launch/abandon
// paths, which the promise state machine runs at most once.
unsafe impl<T: Send, F: Send> Send for CallbackCell<T, F> {}
unsafe impl<T: Send, F: Send> Sync for CallbackCell<T, F> {}

/// Consumer frame for [`Promise::set_callback`].
struct CallbackFrame<T, F> {
    core: Arc<dyn PromiseCore<T>>,
    callback: Mutex<Option<F>>,
}

impl<T, F> Wake for CallbackFrame<T, F>
where
    F: FnOnce(Promise<T>) + Send + 'static,
    T: Send + 'static,
{
    fn wake(self: Arc<Self>) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callback) = callback {
            let outcome = self.core.cell().take_outcome();
            callback(Promise::from_outcome(outcome));
        }
    }
}

/// Deferred producer launch, returned to `set_callback` callers.
struct LaunchFrame<T> {
    core: Mutex<Option<Arc<dyn PromiseCore<T>>>>,
}

impl<T: Send + 'static> Wake for LaunchFrame<T> {
    fn wake(self: Arc<Self>) {
        let core = self
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(core) = core {
            core.launch().resume();
        }
    }
}

// === awaitable adapters ===

/// Future returned by [`Promise::has_value`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
#[derive(Debug)]
pub struct HasValue<'a, T> {
    promise: &'a mut Promise<T>,
}

impl<T> Future for HasValue<'_, T> {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.promise.poll_resolve(cx) {
            Poll::Ready(()) => Poll::Ready(self.promise.peek().is_value()),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`Promise::is_empty`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
#[derive(Debug)]
pub struct IsEmpty<'a, T> {
    promise: &'a mut Promise<T>,
}

impl<T> Future for IsEmpty<'_, T> {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.promise.poll_resolve(cx) {
            Poll::Ready(()) => Poll::Ready(self.promise.peek().is_empty()),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`Promise::get`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
#[derive(Debug)]
pub struct GetValue<T> {
    promise: Promise<T>,
}

impl<T> Future for GetValue<T> {
    type Output = Result<Option<T>, Fault>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.promise.poll_take(cx).map(|outcome| match outcome {
            Outcome::Value(value) => Ok(Some(value)),
            Outcome::Empty => Ok(None),
            Outcome::Fault(fault) => Err(fault),
        })
    }
}
