//! A single-shot broadcast rendezvous.
//!
//! Consumers [`subscribe`](Distributor::subscribe) under an opaque
//! [`Ident`]; each subscription receives exactly one broadcast value and is
//! then gone. [`broadcast`](Distributor::broadcast) drains the whole
//! subscriber list atomically, so a subscriber that wants the next value too
//! must re-subscribe after each delivery.
//!
//! Identities make subscriptions addressable: [`kick_out`](Distributor::kick_out)
//! pulls one subscriber out early, and [`alert`](Distributor::alert)
//! combines "prevent new alert-aware registrations" with "evict the one
//! already registered" through an [`AlertFlag`]'s identity, closing the race
//! between alerting and registering.

use crate::lock::{Guarded, RawLock, Spinlock};
use core::fmt;
use std::sync::Arc;
use strand::{AlertFlag, Completion, Fault, Ident, Prepared, Promise};

struct Waiting<T> {
    completion: Completion<T>,
    ident: Ident,
}

struct DistCore<T, L> {
    waiting: Guarded<Vec<Waiting<T>>, L>,
}

/// Broadcasts each value to every subscriber registered at that moment.
/// Cheap to clone; clones share the subscriber list.
pub struct Distributor<T, L: RawLock = Spinlock> {
    core: Arc<DistCore<T, L>>,
}

impl<T, L: RawLock> Clone for Distributor<T, L> {
    fn clone(&self) -> Self {
        Distributor {
            core: self.core.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Distributor<T> {
    /// Returns a distributor with no subscribers.
    pub fn new() -> Self {
        Distributor::with_lock(Spinlock::new())
    }
}

impl<T: Clone + Send + 'static> Default for Distributor<T> {
    fn default() -> Self {
        Distributor::new()
    }
}

impl<T: Clone + Send + 'static, L: RawLock + 'static> Distributor<T, L> {
    /// Returns a distributor guarded by the given lock.
    pub fn with_lock(lock: L) -> Self {
        Distributor {
            core: Arc::new(DistCore {
                waiting: Guarded::new(Vec::new(), lock),
            }),
        }
    }

    /// Subscribes for the next broadcast under `ident`.
    ///
    /// Registration happens when the promise is first awaited. The identity
    /// is an opaque key for [`kick_out`](Self::kick_out); use
    /// [`Ident::NONE`] for subscriptions that never need eviction.
    pub fn subscribe(&self, ident: Ident) -> Promise<T> {
        let core = self.core.clone();
        Promise::from_fn(move |completion| {
            if !completion.is_connected() {
                return Prepared::none();
            }
            core.waiting.with(|waiting| {
                waiting.push(Waiting { completion, ident });
            });
            Prepared::none()
        })
    }

    /// Subscribes under `flag`'s identity, unless the flag is already set —
    /// in which case the subscription resolves `Empty` immediately.
    ///
    /// Together with [`alert`](Self::alert) this is race-free: the flag is
    /// checked under the distributor's lock, so an alert either finds the
    /// registration and evicts it, or prevents it from being made.
    pub fn subscribe_alertable(&self, flag: &AlertFlag) -> Promise<T> {
        let core = self.core.clone();
        let flag = flag.clone();
        Promise::from_fn(move |completion| {
            if !completion.is_connected() {
                return Prepared::none();
            }
            let mut refused = Some(completion);
            core.waiting.with(|waiting| {
                if !flag.is_set() {
                    waiting.push(Waiting {
                        completion: refused.take().expect("completion consumed twice"),
                        ident: flag.ident(),
                    });
                }
            });
            match refused {
                Some(completion) => completion.cancel(),
                None => Prepared::none(),
            }
        })
    }

    /// Broadcasts `value` to every current subscriber, collecting their
    /// resumptions into `buffer` for the caller to dispatch.
    ///
    /// Subscribers are fulfilled in registration order. The buffer form
    /// lets callers reuse one allocation across broadcasts and choose where
    /// the resumptions run (for example, handing them to a pool).
    pub fn broadcast_with(&self, buffer: &mut Vec<Prepared>, value: T) {
        let drained = self.core.waiting.with(core::mem::take);
        trace!(subscribers = drained.len(), "Distributor::broadcast");
        let count = drained.len();
        let mut value = Some(value);
        for (index, waiter) in drained.into_iter().enumerate() {
            // The last subscriber gets the original, everyone else a clone.
            let item = if index + 1 == count {
                value.take()
            } else {
                value.clone()
            }
            .expect("broadcast value consumed early");
            buffer.push(waiter.completion.complete(item));
        }
    }

    /// Broadcasts `value` and resumes every subscriber on this thread.
    pub fn broadcast(&self, value: T) {
        let mut ready = Vec::new();
        self.broadcast_with(&mut ready, value);
        drop(ready);
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.core.waiting.with(|waiting| waiting.len())
    }

    /// Evicts the subscriber registered under `ident`, resolving it with
    /// whatever `resolver` decides.
    ///
    /// Returns the evicted subscriber's resumption, or an empty handle if
    /// no subscription carries that identity. Removal is by swap, so the
    /// registration order of the remaining subscribers may change.
    pub fn kick_out_with(
        &self,
        ident: Ident,
        resolver: impl FnOnce(Completion<T>) -> Prepared,
    ) -> Prepared {
        let evicted = self.core.waiting.with(|waiting| {
            let position = waiting.iter().position(|waiter| waiter.ident == ident)?;
            Some(waiting.swap_remove(position))
        });
        match evicted {
            Some(waiter) => resolver(waiter.completion),
            None => Prepared::none(),
        }
    }

    /// Evicts the subscriber registered under `ident` with `Empty`; it
    /// observes [`AwaitError::Cancelled`](strand::AwaitError::Cancelled).
    pub fn kick_out(&self, ident: Ident) -> Prepared {
        self.kick_out_with(ident, |completion| completion.cancel())
    }

    /// Evicts the subscriber registered under `ident` with an error.
    pub fn kick_out_fault(&self, ident: Ident, fault: Fault) -> Prepared {
        self.kick_out_with(ident, move |completion| completion.fail_fault(fault))
    }

    /// Sets `flag` and evicts any subscriber registered under its identity
    /// with `Empty`.
    ///
    /// The flag is set under the distributor's lock, so an alert-aware
    /// subscription racing with this call either never registers or is
    /// evicted here; it cannot slip through.
    pub fn alert(&self, flag: &AlertFlag) -> Prepared {
        let evicted = self.core.waiting.with(|waiting| {
            flag.set();
            let position = waiting
                .iter()
                .position(|waiter| waiter.ident == flag.ident())?;
            Some(waiting.swap_remove(position))
        });
        match evicted {
            Some(waiter) => waiter.completion.cancel(),
            None => Prepared::none(),
        }
    }
}

impl<T, L: RawLock> fmt::Debug for Distributor<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Distributor(..)")
    }
}

#[cfg(all(test, not(loom)))]
mod tests;
