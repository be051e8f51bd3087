//! Alert flags and opaque registration identities.
//!
//! An [`Ident`] is a cheap opaque key used when registering with the
//! distributor or the timer scheduler, so a later call can find and evict
//! the registration. An [`AlertFlag`] couples an atomic boolean with its own
//! identity: setting the flag both *prevents* future alert-aware
//! registrations and, through the identity, lets the owning component *wake*
//! an already-registered waiter.

// Plain `core` atomics, even under loom: the flag is a relaxed boolean
// signal (no data is published through it) and the identity counter must be
// usable in a static.
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use core::fmt;
use std::sync::Arc;

/// An opaque registration identity.
///
/// Identities are only ever compared for equality; they are never
/// dereferenced. [`Ident::unique`] mints a fresh one; [`Ident::NONE`] is the
/// "don't care" identity used by registrations that never need eviction.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Ident(u64);

impl Ident {
    /// The identity carried by registrations that cannot be addressed.
    pub const NONE: Ident = Ident(0);

    /// Mints a process-unique identity.
    pub fn unique() -> Ident {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Ident(NEXT.fetch_add(1, Relaxed))
    }

    /// Returns `true` for [`Ident::NONE`].
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.pad("Ident::NONE")
        } else {
            f.debug_tuple("Ident").field(&self.0).finish()
        }
    }
}

/// A one-bit alert signal with an eviction identity.
///
/// The flag itself is a plain atomic boolean with relaxed ordering (it
/// carries no data, only the signal). Components that support alert-aware
/// registration check the flag under their own lock before registering, and
/// their `alert` operations set the flag and evict any waiter registered
/// under [`ident()`](Self::ident) — so a racing alert can never be missed:
/// either registration is refused, or the registered waiter is pulled out.
///
/// `AlertFlag` is a cheap clone handle; all clones share the flag and the
/// identity.
#[derive(Clone)]
pub struct AlertFlag {
    shared: Arc<FlagShared>,
}

struct FlagShared {
    flag: AtomicBool,
    ident: Ident,
}

impl AlertFlag {
    /// Returns a new, clear flag with a fresh identity.
    pub fn new() -> Self {
        AlertFlag {
            shared: Arc::new(FlagShared {
                flag: AtomicBool::new(false),
                ident: Ident::unique(),
            }),
        }
    }

    /// Returns `true` if the flag is set.
    pub fn is_set(&self) -> bool {
        self.shared.flag.load(Relaxed)
    }

    /// Sets the flag.
    ///
    /// Note that setting the flag directly does not evict registered
    /// waiters; use the owning component's `alert` operation for that.
    pub fn set(&self) {
        self.shared.flag.store(true, Relaxed);
    }

    /// Clears the flag.
    pub fn reset(&self) {
        self.shared.flag.store(false, Relaxed);
    }

    /// Clears the flag, returning whether it was set.
    pub fn test_and_reset(&self) -> bool {
        self.shared.flag.swap(false, Relaxed)
    }

    /// The identity alert-aware registrations are filed under.
    pub fn ident(&self) -> Ident {
        self.shared.ident
    }
}

impl Default for AlertFlag {
    fn default() -> Self {
        AlertFlag::new()
    }
}

impl fmt::Debug for AlertFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertFlag")
            .field("set", &self.is_set())
            .field("ident", &self.shared.ident)
            .finish()
    }
}
