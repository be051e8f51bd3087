//! Restartable producer tasks yielding a lazy sequence of values.
//!
//! A [`Generator`] owns one task built from an async body that receives a
//! [`Yielder`]. Each [`call`](Generator::call) drives the body to its next
//! [`yield_value`](Yielder::yield_value) and resolves with the yielded
//! value; when the body returns, the outstanding call resolves `Empty`,
//! marking the end of the sequence.
//!
//! ```
//! use strand::Generator;
//!
//! let mut fibs = Generator::<u64>::new(|y| async move {
//!     let (mut a, mut b) = (1u64, 1);
//!     loop {
//!         y.yield_value(a).await;
//!         (a, b) = (b, a + b);
//!     }
//! });
//! let first: Vec<u64> = fibs.iter().take(5).collect();
//! assert_eq!(first, [1, 1, 2, 3, 5]);
//! ```
//!
//! Generators may await other promises between yields, and can take a
//! per-invocation parameter `P`: the value passed to `call` is returned by
//! the `yield_value(..).await` expression that it resumes.

use crate::frame::Prepared;
use crate::outcome::Fault;
use crate::promise::{Completion, Promise};
use crate::task::{unhandled_fault, Task};
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct GenShared<T, P> {
    state: Mutex<GenState<T, P>>,
}

struct GenState<T, P> {
    /// The generator task, until its first launch.
    task: Option<Task<()>>,
    /// Completion for the call currently being driven.
    target: Option<Completion<T>>,
    /// Parameter for the next yield resumption.
    param: Option<P>,
    /// Wakes the suspended yield point.
    resume: Option<Waker>,
    started: bool,
    done: bool,
}

/// An asynchronous generator of `T`, optionally parameterised by a
/// per-invocation `P`.
///
/// Dropping the generator cancels its task; an outstanding call resolves
/// `Empty` through the completion's drop path, so no caller is left stuck.
pub struct Generator<T, P = ()> {
    shared: Arc<GenShared<T, P>>,
}

impl<T, P> Generator<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    /// Builds a generator from `body`.
    ///
    /// The body receives the [`Yielder`] used to publish values, and runs
    /// lazily: nothing executes until the first call is awaited.
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Yielder<T, P>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shared = Arc::new(GenShared {
            state: Mutex::new(GenState {
                task: None,
                target: None,
                param: None,
                resume: None,
                started: false,
                done: false,
            }),
        });
        let yielder = Yielder {
            shared: Arc::downgrade(&shared),
        };
        let drive = GenDrive {
            body: Box::pin(body(yielder)),
            shared: Arc::downgrade(&shared),
        };
        lock(&shared.state).task = Some(Task::new(drive));
        Generator { shared }
    }

    /// Drives one step of the generator with `param`.
    ///
    /// The returned promise resolves with the next yielded value, or `Empty`
    /// once the body has returned. The generator only advances when the
    /// promise is awaited.
    pub fn call(&mut self, param: P) -> Promise<T> {
        let shared = self.shared.clone();
        Promise::from_fn(move |completion| Self::invoke(&shared, Some(param), completion))
    }

    /// Runs the generator's prologue, up to its first yield, without
    /// supplying a parameter.
    ///
    /// Useful for parameterised generators whose first resumption consumes
    /// no parameter. Resolves `Empty` if the generator has already started.
    pub fn start(&mut self) -> Promise<T> {
        let shared = self.shared.clone();
        Promise::from_fn(move |completion| {
            if lock(&shared.state).started {
                return completion.cancel();
            }
            Self::invoke(&shared, None, completion)
        })
    }

    /// Returns `true` once the generator body has been entered.
    pub fn started(&self) -> bool {
        lock(&self.shared.state).started
    }

    fn invoke(shared: &Arc<GenShared<T, P>>, param: Option<P>, completion: Completion<T>) -> Prepared {
        let mut state = lock(&shared.state);
        if !completion.is_connected() {
            // The call's promise was dropped before it was awaited; leave
            // the generator untouched.
            return Prepared::none();
        }
        if state.done {
            drop(state);
            return completion.cancel();
        }
        debug_assert!(
            state.target.is_none(),
            "a generator call is already being driven"
        );
        state.started = true;
        state.param = param;
        state.target = Some(completion);
        if let Some(task) = state.task.take() {
            drop(state);
            task.start_detached()
        } else {
            Prepared::from(state.resume.take())
        }
    }
}

impl<T: Send + 'static> Generator<T, ()> {
    /// Sugar for [`call`](Self::call) on parameterless generators.
    pub fn next_value(&mut self) -> Promise<T> {
        self.call(())
    }

    /// A blocking iterator over the generated values.
    ///
    /// Each `next()` waits synchronously for one value; the iterator ends
    /// when the body returns. A fault in the body propagates as a panic.
    pub fn iter(&mut self) -> Iter<'_, T> {
        Iter { generator: self }
    }
}

impl<T, P> Drop for Generator<T, P> {
    fn drop(&mut self) {
        let (task, target, resume) = {
            let mut state = lock(&self.shared.state);
            (state.task.take(), state.target.take(), state.resume.take())
        };
        if let Some(task) = task {
            task.cancel();
        }
        // Dropping the resume waker releases the suspended task cell; the
        // body and anything it holds are destroyed in place. An outstanding
        // target resolves Empty via the completion's drop path. Both drops
        // happen outside the state lock, since either may resume a task.
        drop(resume);
        drop(target);
    }
}

impl<T, P> fmt::Debug for Generator<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("Generator")
            .field("started", &state.started)
            .field("done", &state.done)
            .finish()
    }
}

// === Yielder ===

/// Publishes values from inside a generator body.
pub struct Yielder<T, P = ()> {
    shared: Weak<GenShared<T, P>>,
}

impl<T, P> Yielder<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    /// Publishes `value` to the current call and suspends until the next
    /// invocation, whose parameter it returns.
    pub fn yield_value(&self, value: T) -> Yield<T, P> {
        Yield {
            shared: self.shared.clone(),
            value: Some(value),
            published: false,
        }
    }
}

impl<T, P> fmt::Debug for Yielder<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Yielder(..)")
    }
}

/// Future returned by [`Yielder::yield_value`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Yield<T, P> {
    shared: Weak<GenShared<T, P>>,
    value: Option<T>,
    published: bool,
}

// The yielded value is owned, never pinned through.
impl<T, P> Unpin for Yield<T, P> {}

impl<T, P> Future for Yield<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    type Output = P;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let Some(shared) = this.shared.upgrade() else {
            // The generator was dropped; the task is being torn down and
            // will never be resumed again.
            return Poll::Pending;
        };
        let mut state = lock(&shared.state);
        if !this.published {
            // Park the resumption waker *before* publishing, so a consumer
            // that immediately re-calls the generator finds it.
            state.resume = Some(cx.waker().clone());
            if let Some(target) = state.target.take() {
                let value = this.value.take().expect("yield value already taken");
                this.published = true;
                drop(state);
                target.complete(value).resume();
            }
            Poll::Pending
        } else {
            match state.param.take() {
                Some(param) => Poll::Ready(param),
                None => {
                    state.resume = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        }
    }
}

impl<T, P> fmt::Debug for Yield<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Yield")
            .field("published", &self.published)
            .finish()
    }
}

// === the drive future ===

/// Wraps the generator body: routes panics to the current call and resolves
/// the outstanding call `Empty` when the body returns.
struct GenDrive<T, P> {
    body: Pin<Box<dyn Future<Output = ()> + Send>>,
    shared: Weak<GenShared<T, P>>,
}

impl<T, P> GenDrive<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    fn finish(&self, fault: Option<Fault>) {
        let Some(shared) = self.shared.upgrade() else {
            if let Some(fault) = fault {
                unhandled_fault(fault);
            }
            return;
        };
        let target = {
            let mut state = lock(&shared.state);
            state.done = true;
            state.target.take()
        };
        match (target, fault) {
            (Some(target), Some(fault)) => target.fail_fault(fault).resume(),
            (Some(target), None) => target.cancel().resume(),
            (None, Some(fault)) => unhandled_fault(fault),
            (None, None) => {}
        }
    }
}

impl<T, P> Future for GenDrive<T, P>
where
    T: Send + 'static,
    P: Send + 'static,
{
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match panic::catch_unwind(AssertUnwindSafe(|| this.body.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(())) => {
                this.finish(None);
                Poll::Ready(())
            }
            Err(payload) => {
                this.finish(Some(Fault::from_panic(payload)));
                Poll::Ready(())
            }
        }
    }
}

// === blocking iterator ===

/// Blocking iterator adapter returned by [`Generator::iter`].
#[derive(Debug)]
pub struct Iter<'a, T> {
    generator: &'a mut Generator<T, ()>,
}

impl<T: Send + 'static> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        match self.generator.next_value().wait() {
            Ok(value) => Some(value),
            Err(error) => match error.into_fault() {
                None => None,
                Some(fault) => match fault.clone().into_panic() {
                    Some(payload) => panic::resume_unwind(payload),
                    None => panic!("generator faulted: {fault}"),
                },
            },
        }
    }
}
