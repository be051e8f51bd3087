//! The pluggable blocking-lock contract used by the queue and distributor.
//!
//! These primitives guard their internal registries with a short-lived
//! blocking lock. The lock type is pluggable so that single-threaded
//! deployments can opt out entirely ([`NullLock`]); the default is a
//! spinlock with exponential backoff.

use core::fmt;
use crate::loom::{
    hint,
    sync::atomic::{AtomicBool, Ordering::{Acquire, Release}},
};

/// A raw blocking mutual-exclusion lock.
///
/// # Safety
///
/// Implementations must guarantee actual mutual exclusion: `lock` may not
/// return while another holder exists. [`NullLock`] is the deliberate
/// exception; its constructor is `unsafe` and shifts that guarantee to the
/// caller.
pub unsafe trait RawLock: Send + Sync {
    /// Acquires the lock, blocking the current thread until it is available.
    fn lock(&self);

    /// Attempts to acquire the lock without blocking.
    fn try_lock(&self) -> bool;

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// May only be called by the current holder.
    unsafe fn unlock(&self);
}

/// A test-and-set spinlock with exponential backoff.
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    loom_const_fn! {
        /// Returns a new, unlocked spinlock.
        #[must_use]
        pub fn new() -> Self {
            Self {
                locked: AtomicBool::new(false),
            }
        }
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Spinlock::new()
    }
}

unsafe impl RawLock for Spinlock {
    fn lock(&self) {
        let mut backoff = Backoff::new();
        while self
            .locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_err()
        {
            while self.locked.load(Acquire) {
                backoff.spin();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Acquire, Acquire)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Release);
    }
}

impl fmt::Debug for Spinlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock")
            .field("locked", &self.locked.load(Acquire))
            .finish()
    }
}

/// A no-op lock for single-threaded deployments.
///
/// All locking operations succeed immediately without synchronizing
/// anything.
#[derive(Debug)]
pub struct NullLock {
    _priv: (),
}

impl NullLock {
    /// Returns a new no-op lock.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the component guarded by this lock is
    /// never accessed from more than one thread at a time.
    #[must_use]
    pub const unsafe fn new() -> Self {
        NullLock { _priv: () }
    }
}

unsafe impl RawLock for NullLock {
    fn lock(&self) {}

    fn try_lock(&self) -> bool {
        true
    }

    unsafe fn unlock(&self) {}
}

/// Exponential backoff for spin loops.
struct Backoff {
    exp: u8,
}

impl Backoff {
    const MAX_EXP: u8 = 8;

    const fn new() -> Self {
        Backoff { exp: 0 }
    }

    fn spin(&mut self) {
        for _ in 0..(1u32 << self.exp) {
            hint::spin_loop();
        }
        if self.exp < Self::MAX_EXP {
            self.exp += 1;
        }
    }
}

/// A value guarded by a [`RawLock`], with closure-scoped access.
///
/// Wake handles collected while the closure runs must be dispatched *after*
/// it returns, so resumed tasks never run under the lock.
pub(crate) struct Guarded<T, L> {
    lock: L,
    data: crate::loom::cell::UnsafeCell<T>,
}

impl<T, L: RawLock> Guarded<T, L> {
    pub(crate) fn new(data: T, lock: L) -> Self {
        Guarded {
            lock,
            data: crate::loom::cell::UnsafeCell::new(data),
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.lock.lock();
        let result = self.data.with_mut(|data| f(unsafe { &mut *data }));
        unsafe { self.lock.unlock() };
        result
    }
}

impl<T: fmt::Debug, L: RawLock> fmt::Debug for Guarded<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lock.try_lock() {
            let result = self.data.with(|data| unsafe { &*data }.fmt(f));
            unsafe { self.lock.unlock() };
            result
        } else {
            f.pad("<locked>")
        }
    }
}

// Safety: access to `data` only happens under the lock.
unsafe impl<T: Send, L: RawLock> Send for Guarded<T, L> {}
unsafe impl<T: Send, L: RawLock> Sync for Guarded<T, L> {}
