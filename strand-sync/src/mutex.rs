//! An ownership-token mutex for cooperative tasks, plus a deadlock-avoiding
//! multi-lock.
//!
//! Unlike a guard tied to a stack frame, [`lock`](Mutex::lock) resolves to a
//! movable [`Ownership`] token: the mutex is held for as long as the token
//! lives, across awaits and across threads. Dropping (or
//! [`release`](Ownership::release)-ing) the token unlocks and hands the
//! mutex to the next waiter.
//!
//! # Algorithm
//!
//! Waiters are kept in two lists:
//!
//! - `requests` — a lock-free LIFO stack pushed by arriving waiters. A
//!   per-mutex *doorman* sentinel at the bottom of the stack means "the
//!   mutex is held".
//! - `queue` — a FIFO owned exclusively by the current holder.
//!
//! A waiter whose push finds the stack empty has acquired the mutex; it
//! swaps the stack to the doorman and reverses the captured tail into the
//! queue, so waiters that piled up behind it are served first-come,
//! first-served. Unlock either CASes the doorman out (fully released) or
//! drains late pushers the same way, then transfers ownership to the queue
//! head. FIFO order is guaranteed within one such drain epoch.

use crate::loom::{
    cell::UnsafeCell,
    sync::atomic::{
        AtomicPtr,
        Ordering::{AcqRel, Acquire, Relaxed},
    },
};
use core::fmt;
use core::ptr;
use std::sync::Arc;
use strand::{Completion, Prepared, Promise};

struct WaitNode {
    next: *mut WaitNode,
    completion: Option<Completion<Ownership>>,
}

struct MutexCore {
    /// Lock-free LIFO of arriving waiters; `null` means unlocked, the
    /// doorman sentinel means locked with an empty stack.
    requests: AtomicPtr<WaitNode>,
    /// FIFO of drained waiters. Only the current holder touches this.
    queue: UnsafeCell<*mut WaitNode>,
    /// Sentinel node; never carries a completion.
    doorman: *mut WaitNode,
}

/// An asynchronous mutual-exclusion lock handing out [`Ownership`] tokens.
///
/// Cheap to clone; clones share the lock state.
#[derive(Clone)]
pub struct Mutex {
    core: Arc<MutexCore>,
}

impl Mutex {
    /// Returns a new, unlocked mutex.
    pub fn new() -> Self {
        let doorman = Box::into_raw(Box::new(WaitNode {
            next: ptr::null_mut(),
            completion: None,
        }));
        Mutex {
            core: Arc::new(MutexCore {
                requests: AtomicPtr::new(ptr::null_mut()),
                queue: UnsafeCell::new(ptr::null_mut()),
                doorman,
            }),
        }
    }

    /// Attempts to acquire the mutex without waiting.
    pub fn try_lock(&self) -> Option<Ownership> {
        if self
            .core
            .requests
            .compare_exchange(
                ptr::null_mut(),
                self.core.doorman,
                AcqRel,
                Acquire,
            )
            .is_ok()
        {
            Some(Ownership {
                core: Some(self.core.clone()),
            })
        } else {
            None
        }
    }

    /// Acquires the mutex.
    ///
    /// If the mutex is free, the returned promise is already resolved.
    /// Otherwise the caller is enqueued when the promise is first awaited;
    /// dropping the promise before then cancels the request entirely, and
    /// dropping it while enqueued forwards the eventual ownership straight
    /// to the next waiter.
    pub fn lock(&self) -> Promise<Ownership> {
        if let Some(ownership) = self.try_lock() {
            return Promise::from_value(ownership);
        }
        let core = self.core.clone();
        Promise::from_fn(move |completion| {
            if !completion.is_connected() {
                return Prepared::none();
            }
            MutexCore::add_request(&core, completion)
        })
    }

    /// Returns `true` if the mutex is currently held.
    pub fn is_locked(&self) -> bool {
        !self.core.requests.load(Acquire).is_null()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Mutex::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl MutexCore {
    /// Pushes a waiter onto the request stack; if the push found the stack
    /// empty, the waiter has acquired the mutex and is resumed immediately.
    fn add_request(this: &Arc<Self>, completion: Completion<Ownership>) -> Prepared {
        let node = Box::into_raw(Box::new(WaitNode {
            next: ptr::null_mut(),
            completion: Some(completion),
        }));
        let mut head = ptr::null_mut();
        loop {
            unsafe { (*node).next = head };
            match this
                .requests
                .compare_exchange(head, node, AcqRel, Acquire)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        if head.is_null() {
            // The push found the mutex free: this waiter holds the lock.
            // Claim the stack (anyone who piled on behind us is captured),
            // and queue them oldest-first.
            let tail = this.requests.swap(this.doorman, AcqRel);
            unsafe {
                this.enqueue_reversed(tail, node);
            }
            Self::resume_node(this, node)
        } else {
            trace!(node = ?node, "Mutex: waiter parked");
            Prepared::none()
        }
    }

    /// Reverses the stack segment `[from, to)` onto the front of `queue`.
    ///
    /// # Safety
    ///
    /// Caller must hold the mutex (only the holder touches `queue`), and
    /// `to` must be reachable from `from`.
    unsafe fn enqueue_reversed(&self, mut from: *mut WaitNode, to: *mut WaitNode) {
        self.queue.with_mut(|queue| {
            let queue = &mut *queue;
            while from != to {
                let next = (*from).next;
                (*from).next = *queue;
                *queue = from;
                from = next;
            }
        })
    }

    /// Frees `node` and resolves its waiter with ownership of this mutex.
    fn resume_node(this: &Arc<Self>, node: *mut WaitNode) -> Prepared {
        let completion = {
            let mut node = unsafe { Box::from_raw(node) };
            node.completion.take().expect("waiter node without completion")
        };
        completion.complete(Ownership {
            core: Some(this.clone()),
        })
    }

    /// Releases the mutex held by the caller, transferring ownership to the
    /// earliest queued waiter if there is one.
    fn unlock(this: &Arc<Self>) -> Prepared {
        let queued = this.queue.with_mut(|queue| unsafe { *queue });
        if queued.is_null() {
            // Nobody was drained yet; if nobody pushed either, release
            // fully.
            if test_dbg!(this
                .requests
                .compare_exchange(this.doorman, ptr::null_mut(), AcqRel, Acquire)
                .is_ok())
            {
                return Prepared::none();
            }
            // Late pushers arrived; drain them into the queue (a new
            // epoch).
            test_trace!("Mutex::unlock: draining late pushers");
            let tail = this.requests.swap(this.doorman, AcqRel);
            unsafe {
                this.enqueue_reversed(tail, this.doorman);
            }
        }
        let node = this.queue.with_mut(|queue| unsafe {
            let queue = &mut *queue;
            let node = *queue;
            debug_assert!(!node.is_null(), "drain left the queue empty");
            *queue = (*node).next;
            node
        });
        Self::resume_node(this, node)
    }
}

impl Drop for MutexCore {
    fn drop(&mut self) {
        unsafe {
            let mut node = self.queue.with_mut(|queue| *queue);
            while !node.is_null() {
                let boxed = Box::from_raw(node);
                node = boxed.next;
            }
            let mut node = self.requests.load(Relaxed);
            while !node.is_null() && node != self.doorman {
                let boxed = Box::from_raw(node);
                node = boxed.next;
            }
            drop(Box::from_raw(self.doorman));
        }
    }
}

// Safety: the request stack is synchronized by its CAS protocol, and the
// queue is accessed only by the current lock holder.
unsafe impl Send for MutexCore {}
unsafe impl Sync for MutexCore {}

// === Ownership ===

/// Ownership of a locked [`Mutex`].
///
/// Move-only; the mutex is released when the token is dropped or
/// [`release`](Self::release)d, resuming the next queued waiter.
#[must_use = "dropping an Ownership releases the mutex immediately"]
#[derive(Default)]
pub struct Ownership {
    core: Option<Arc<MutexCore>>,
}

impl Ownership {
    /// Returns a token that does not own any mutex.
    pub fn unowned() -> Self {
        Ownership { core: None }
    }

    /// Returns `true` if this token holds a mutex.
    pub fn owns_lock(&self) -> bool {
        self.core.is_some()
    }

    /// Releases the mutex now, returning the next waiter's resumption.
    ///
    /// After this call the token is unowned. Releasing an unowned token is
    /// a no-op.
    pub fn release(&mut self) -> Prepared {
        match self.core.take() {
            Some(core) => MutexCore::unlock(&core),
            None => Prepared::none(),
        }
    }
}

impl Drop for Ownership {
    fn drop(&mut self) {
        self.release().resume();
    }
}

impl fmt::Debug for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ownership")
            .field("owns_lock", &self.owns_lock())
            .finish()
    }
}

// === MultiLock ===

struct MultiInner {
    slots: Vec<Option<Mutex>>,
    /// Index of the mutex acquired asynchronously first; advanced to the
    /// most recent try-lock failure.
    start: core::sync::atomic::AtomicUsize,
}

/// Acquires a set of [`Mutex`]es together without deadlocking.
///
/// The acquisition strategy: await the *start* mutex, then try-lock the
/// rest in rotation order. On the first failure everything acquired so far
/// is released, the failed mutex becomes the new start, and the cycle
/// repeats. Because every asynchronous wait is for the mutex that actually
/// blocked progress, contention cycles between multi-locks cannot deadlock.
///
/// Slots other than the first may be empty, letting a fixed-arity lock set
/// be partially populated.
#[derive(Clone)]
pub struct MultiLock {
    inner: Arc<MultiInner>,
}

impl MultiLock {
    /// Builds a multi-lock over `slots`.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is empty or its first entry is `None`.
    pub fn new(slots: impl IntoIterator<Item = Option<Mutex>>) -> Self {
        let slots: Vec<Option<Mutex>> = slots.into_iter().collect();
        assert!(
            matches!(slots.first(), Some(Some(_))),
            "MultiLock requires a non-empty first slot"
        );
        MultiLock {
            inner: Arc::new(MultiInner {
                slots,
                start: core::sync::atomic::AtomicUsize::new(0),
            }),
        }
    }

    /// Builds a multi-lock over every mutex in `mutexes`.
    pub fn all(mutexes: impl IntoIterator<Item = Mutex>) -> Self {
        MultiLock::new(mutexes.into_iter().map(Some))
    }

    /// Acquires every mutex in the set.
    pub fn lock(&self) -> Promise<MultiOwnership> {
        let inner = self.inner.clone();
        Promise::from_task(strand::Task::new(async move {
            loop {
                let start = inner.start.load(Relaxed);
                let first = inner.slots[start]
                    .as_ref()
                    .expect("rotation start always points at a populated slot");
                let first_ownership = match first.lock().await {
                    Ok(ownership) => ownership,
                    Err(_) => unreachable!("mutex waits are never cancelled"),
                };

                let count = inner.slots.len();
                let mut owned = Vec::with_capacity(count);
                owned.push(first_ownership);
                let mut failed = None;
                for offset in 1..count {
                    let index = (start + offset) % count;
                    if let Some(mutex) = &inner.slots[index] {
                        match mutex.try_lock() {
                            Some(ownership) => owned.push(ownership),
                            None => {
                                failed = Some(index);
                                break;
                            }
                        }
                    }
                }
                match failed {
                    None => return MultiOwnership { owned },
                    Some(index) => {
                        // Roll everything back and wait on the mutex that
                        // actually blocked us.
                        drop(owned);
                        inner.start.store(index, Relaxed);
                    }
                }
            }
        }))
    }
}

impl fmt::Debug for MultiLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiLock")
            .field("slots", &self.inner.slots.len())
            .finish()
    }
}

/// Ownership of every mutex in a [`MultiLock`] set.
#[must_use = "dropping a MultiOwnership releases every held mutex"]
#[derive(Debug)]
pub struct MultiOwnership {
    owned: Vec<Ownership>,
}

impl MultiOwnership {
    /// Moves the individual ownership tokens out.
    pub fn into_inner(self) -> Vec<Ownership> {
        self.owned
    }
}

#[cfg(all(test, not(loom)))]
mod tests;

#[cfg(all(loom, test))]
mod loom_tests {
    use super::*;
    use crate::loom::{self, thread};

    #[test]
    fn contended_lock_unlock() {
        loom::model(|| {
            let mutex = Mutex::new();

            let contender = {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    let ownership =
                        loom::future::block_on(mutex.lock()).expect("lock never cancels");
                    drop(ownership);
                })
            };

            let ownership = loom::future::block_on(mutex.lock()).expect("lock never cancels");
            drop(ownership);
            contender.join().unwrap();
        });
    }

    #[test]
    fn try_lock_race() {
        loom::model(|| {
            let mutex = Mutex::new();
            let other = {
                let mutex = mutex.clone();
                thread::spawn(move || mutex.try_lock().is_some())
            };
            let mine = mutex.try_lock().is_some();
            let theirs = other.join().unwrap();
            assert!(
                !(mine && theirs),
                "two try_locks must never both succeed"
            );
        });
    }
}
