//! Combinators over sets of pending promises.
//!
//! [`WhenAll`] resolves once every added promise has resolved; [`WhenEach`]
//! yields a caller-chosen uid for each promise as it resolves, in completion
//! order. Neither combinator consumes outcomes: after a promise's completion
//! has been observed through a combinator, awaiting the promise itself still
//! returns its value (or fault) immediately.

use crate::frame::Prepared;
use crate::outcome::INVALID_STATE;
use crate::promise::{Completion, Promise};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering::AcqRel};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::{Wake, Waker};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// === WhenAll ===

/// Waits until every added promise has resolved.
///
/// ```
/// use strand::{Promise, WhenAll};
///
/// let mut a = Promise::from_value(1);
/// let mut b = Promise::from_value(2);
/// let all = WhenAll::new();
/// all.add(&mut a).resume();
/// all.add(&mut b).resume();
/// assert!(all.join().wait().is_ok());
/// ```
///
/// The counter starts at one so that adding promises while others are
/// already completing cannot fire the join prematurely; [`join`](Self::join)
/// consumes that initial count.
pub struct WhenAll {
    shared: Arc<AllShared>,
}

struct AllShared {
    remaining: AtomicUsize,
    target: Mutex<Option<Completion<()>>>,
}

impl AllShared {
    fn arrive(&self) -> Prepared {
        if self.remaining.fetch_sub(1, AcqRel) == 1 {
            if let Some(completion) = lock(&self.target).take() {
                return completion.complete(());
            }
        }
        Prepared::none()
    }
}

impl Wake for AllShared {
    fn wake(self: Arc<Self>) {
        self.arrive().resume();
    }
}

impl WhenAll {
    /// Returns an empty set.
    pub fn new() -> Self {
        WhenAll {
            shared: Arc::new(AllShared {
                remaining: AtomicUsize::new(1),
                target: Mutex::new(None),
            }),
        }
    }

    /// Registers `promise` with the set, starting its producer.
    ///
    /// Already-resolved promises are not counted. The returned [`Prepared`]
    /// carries the producer's initial resumption; dropping it starts the
    /// producer immediately.
    pub fn add<T>(&self, promise: &mut Promise<T>) -> Prepared {
        if promise.is_ready() {
            return Prepared::none();
        }
        self.shared.remaining.fetch_add(1, AcqRel);
        promise.subscribe(Waker::from(self.shared.clone()))
    }

    /// Starts the join: the returned promise resolves once every added
    /// promise has.
    pub fn join(&self) -> Promise<()> {
        let shared = self.shared.clone();
        Promise::from_fn(move |completion| {
            if !completion.is_connected() {
                return Prepared::none();
            }
            let replaced = lock(&shared.target).replace(completion);
            assert!(replaced.is_none(), "{INVALID_STATE}: join already pending");
            shared.arrive()
        })
    }

    /// Re-arms a completed set so it can be used for another round.
    ///
    /// Returns `false` if the set is still being awaited.
    pub fn reset(&self) -> bool {
        self.shared
            .remaining
            .compare_exchange(0, 1, AcqRel, core::sync::atomic::Ordering::Acquire)
            .is_ok()
    }
}

impl Default for WhenAll {
    fn default() -> Self {
        WhenAll::new()
    }
}

impl fmt::Debug for WhenAll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhenAll")
            .field(
                "remaining",
                &self.shared.remaining.load(core::sync::atomic::Ordering::Relaxed),
            )
            .finish()
    }
}

// === WhenEach ===

/// Yields registered promises' uids in completion order.
///
/// Each added promise carries a caller-chosen `uid`; every call to
/// [`next`](Self::next) resolves with the uid of the next promise to
/// complete (promises that were already resolved when added are delivered
/// first, in registration order). Once every added uid has been yielded,
/// `next` resolves to `Empty`.
///
/// The first `next` on a freshly-filled set is the "any of" race: it yields
/// the winner.
pub struct WhenEach {
    shared: Arc<EachShared>,
}

struct EachShared {
    state: Mutex<EachState>,
}

struct EachState {
    /// Uids whose promises have completed but have not been yielded.
    done: VecDeque<u32>,
    /// The pending `next` call, if any.
    waiting: Option<Completion<u32>>,
    /// Added but not yet yielded.
    outstanding: usize,
}

/// Per-promise consumer frame.
struct EachSlot {
    shared: Arc<EachShared>,
    uid: u32,
}

impl Wake for EachSlot {
    fn wake(self: Arc<Self>) {
        self.shared.complete_one(self.uid).resume();
    }
}

impl EachShared {
    fn complete_one(&self, uid: u32) -> Prepared {
        let mut state = lock(&self.state);
        match state.waiting.take() {
            Some(completion) => {
                state.outstanding -= 1;
                drop(state);
                completion.complete(uid)
            }
            None => {
                state.done.push_back(uid);
                Prepared::none()
            }
        }
    }
}

impl WhenEach {
    /// Returns an empty set.
    pub fn new() -> Self {
        WhenEach {
            shared: Arc::new(EachShared {
                state: Mutex::new(EachState {
                    done: VecDeque::new(),
                    waiting: None,
                    outstanding: 0,
                }),
            }),
        }
    }

    /// Registers `promise` under `uid`, starting its producer.
    ///
    /// Promises may be added at any time, including between `next` calls.
    /// The returned [`Prepared`] carries the producer's initial resumption.
    pub fn add<T>(&self, promise: &mut Promise<T>, uid: u32) -> Prepared {
        lock(&self.shared.state).outstanding += 1;
        if promise.is_ready() {
            return self.shared.complete_one(uid);
        }
        let slot = Arc::new(EachSlot {
            shared: self.shared.clone(),
            uid,
        });
        promise.subscribe(Waker::from(slot))
    }

    /// Number of added promises whose uids have not been yielded yet.
    pub fn remaining(&self) -> usize {
        lock(&self.shared.state).outstanding
    }

    /// Resolves with the uid of the next promise to complete, or `Empty`
    /// once every added promise has been yielded.
    ///
    /// At most one `next` may be pending at a time.
    pub fn next(&self) -> Promise<u32> {
        let shared = self.shared.clone();
        Promise::from_fn(move |completion| {
            if !completion.is_connected() {
                return Prepared::none();
            }
            let mut state = lock(&shared.state);
            if let Some(uid) = state.done.pop_front() {
                state.outstanding -= 1;
                drop(state);
                return completion.complete(uid);
            }
            if state.outstanding == 0 {
                drop(state);
                return completion.cancel();
            }
            assert!(
                state.waiting.is_none(),
                "{INVALID_STATE}: a `next` call is already pending"
            );
            state.waiting = Some(completion);
            Prepared::none()
        })
    }
}

impl Default for WhenEach {
    fn default() -> Self {
        WhenEach::new()
    }
}

impl fmt::Debug for WhenEach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("WhenEach")
            .field("outstanding", &state.outstanding)
            .field("buffered", &state.done.len())
            .field("awaiting", &state.waiting.is_some())
            .finish()
    }
}
