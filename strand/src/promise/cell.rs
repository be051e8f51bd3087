//! The rendezvous cell: one-shot delivery of an [`Outcome`] from a producer
//! to at most one registered consumer frame.
//!
//! The waker-registration protocol follows the tokio `AtomicWaker` strategy
//! (a `REGISTERING` bit taken by the consumer, a `READY` publication bit set
//! by the producer, and a post-registration re-check that resolves the race
//! between the two). Exclusive producer access is guaranteed structurally:
//! only one [`Completion`](crate::Completion) exists per cell, and it is
//! move-only.

use crate::loom::{
    cell::UnsafeCell,
    sync::atomic::{
        AtomicU8,
        Ordering::{AcqRel, Acquire, Relaxed},
    },
};
use crate::outcome::Outcome;
use core::fmt;
use core::task::{Context, Poll, Waker};

pub(crate) struct RendezvousCell<T> {
    state: AtomicU8,
    waker: UnsafeCell<Option<Waker>>,
    slot: UnsafeCell<Option<Outcome<T>>>,
}

/// Consumer is writing the waker slot.
const REGISTERING: u8 = 0b0001;
/// A waker is stored and may be taken by the producer.
const WAKER: u8 = 0b0010;
/// The outcome slot is populated; no new registration may begin.
const READY: u8 = 0b0100;
/// The consumer side is gone; the produced outcome will be discarded.
const DETACHED: u8 = 0b1000;

impl<T> RendezvousCell<T> {
    loom_const_fn! {
        pub(crate) fn new() -> Self {
            Self {
                state: AtomicU8::new(0),
                waker: UnsafeCell::new(None),
                slot: UnsafeCell::new(None),
            }
        }
    }

    /// Returns `true` once an outcome has been published.
    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        self.state.load(Acquire) & READY != 0
    }

    /// Returns `true` if the consumer side has been dropped.
    #[inline]
    pub(crate) fn is_detached(&self) -> bool {
        self.state.load(Acquire) & DETACHED != 0
    }

    /// Consumer side: takes the published outcome, or registers the waker
    /// from `cx` to be woken when one is published.
    ///
    /// There is exactly one consumer per cell; re-registration replaces the
    /// stored waker.
    pub(crate) fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
        loop {
            let state = test_dbg!(self.state.load(Acquire));
            if state & READY != 0 {
                return Poll::Ready(self.take_outcome());
            }
            debug_assert_eq!(
                state & REGISTERING,
                0,
                "a second consumer raced to register with this cell"
            );
            if self
                .state
                .compare_exchange(state, state | REGISTERING, AcqRel, Acquire)
                .is_err()
            {
                // The producer published while we were looking; reload.
                continue;
            }

            let waker = cx.waker().clone();
            let prev = self.waker.with_mut(|slot| unsafe { (*slot).replace(waker) });
            drop(prev);

            match self.state.compare_exchange(
                state | REGISTERING,
                (state | WAKER) & !REGISTERING,
                AcqRel,
                Acquire,
            ) {
                Ok(_) => return Poll::Pending,
                Err(actual) => {
                    // The only transition possible while REGISTERING is held
                    // is the producer setting READY. Unwind the registration
                    // and consume the outcome directly.
                    debug_assert!(actual & READY != 0);
                    let ours = self.waker.with_mut(|slot| unsafe { (*slot).take() });
                    drop(ours);
                    self.state.fetch_and(!(REGISTERING | WAKER), AcqRel);
                    return Poll::Ready(self.take_outcome());
                }
            }
        }
    }

    /// Producer side: publishes `outcome` and returns the consumer's waker
    /// if one was registered.
    ///
    /// May be called at most once per cell (enforced by `Completion` being
    /// move-only). Returns `None` when the consumer is detached or has not
    /// registered yet.
    pub(crate) fn fulfill(&self, outcome: Outcome<T>) -> Option<Waker> {
        self.slot.with_mut(|slot| unsafe {
            debug_assert!((*slot).is_none(), "cell fulfilled twice");
            *slot = Some(outcome);
        });
        let prev = test_dbg!(self.state.fetch_or(READY, AcqRel));
        if prev & DETACHED != 0 {
            // Nobody will come for the outcome; drop it eagerly so values do
            // not outlive their producer-visible lifetime.
            self.slot.with_mut(|slot| drop(unsafe { (*slot).take() }));
            return None;
        }
        if prev & REGISTERING != 0 {
            // The consumer is mid-registration; its confirmation CAS will
            // fail, observe READY, and consume the outcome itself.
            return None;
        }
        if prev & WAKER != 0 {
            return self.take_waker();
        }
        None
    }

    /// Consumer side: marks the cell detached and discards any registered
    /// waker. Called when the promise is dropped while a producer runs.
    pub(crate) fn detach(&self) {
        test_trace!("RendezvousCell::detach");
        let prev = self.state.fetch_or(DETACHED, AcqRel);
        if prev & WAKER != 0 && prev & REGISTERING == 0 {
            drop(self.take_waker());
        }
    }

    /// Takes the published outcome. Caller must have observed `READY`.
    pub(crate) fn take_outcome(&self) -> Outcome<T> {
        debug_assert!(self.state.load(Relaxed) & READY != 0);
        self.slot
            .with_mut(|slot| unsafe { (*slot).take() })
            .expect("outcome taken twice from a rendezvous cell")
    }

    fn take_waker(&self) -> Option<Waker> {
        let prev = self.state.fetch_and(!WAKER, AcqRel);
        if prev & WAKER != 0 && prev & REGISTERING == 0 {
            self.waker.with_mut(|slot| unsafe { (*slot).take() })
        } else {
            None
        }
    }
}

// Safety: the waker slot is guarded by the REGISTERING/WAKER bits and the
// outcome slot by the READY bit plus single-consumer/single-producer
// structure; `T` crossing threads requires `T: Send`.
unsafe impl<T: Send> Send for RendezvousCell<T> {}
unsafe impl<T: Send> Sync for RendezvousCell<T> {}

impl<T> fmt::Debug for RendezvousCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load(Relaxed);
        f.debug_struct("RendezvousCell")
            .field("ready", &(state & READY != 0))
            .field("detached", &(state & DETACHED != 0))
            .field("waker", &(state & WAKER != 0))
            .finish()
    }
}

#[cfg(all(loom, test))]
mod loom_tests {
    use super::*;
    use crate::loom::{self, future, thread};
    use std::sync::Arc;

    #[test]
    fn fulfill_vs_register() {
        loom::model(|| {
            let cell = Arc::new(RendezvousCell::<u32>::new());

            let producer = {
                let cell = cell.clone();
                thread::spawn(move || {
                    if let Some(waker) = cell.fulfill(Outcome::Value(7)) {
                        waker.wake();
                    }
                })
            };

            let outcome = future::block_on(core::future::poll_fn(|cx| cell.poll_outcome(cx)));
            assert!(matches!(outcome, Outcome::Value(7)));
            producer.join().unwrap();
        });
    }

    #[test]
    fn fulfill_vs_detach() {
        loom::model(|| {
            let cell = Arc::new(RendezvousCell::<u32>::new());

            let producer = {
                let cell = cell.clone();
                thread::spawn(move || {
                    if let Some(waker) = cell.fulfill(Outcome::Value(1)) {
                        waker.wake();
                    }
                })
            };

            cell.detach();
            producer.join().unwrap();
        });
    }
}
