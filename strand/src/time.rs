//! Clocks, sleeps, and the timer [`Scheduler`].
//!
//! The scheduler resolves sleep promises in deadline order. It has no
//! thread of its own: either spawn a driver
//! ([`Scheduler::spawn_driver`]), run one inline
//! ([`Scheduler::run`]), drive a future and the timers together on the
//! current thread ([`Scheduler::block_on`]), or — under a test clock —
//! fire due sleepers by hand ([`Scheduler::advance_until`]).

mod clock;
mod scheduler;

pub use self::clock::{Clock, Ticks};
pub use self::scheduler::{Driver, Scheduler};
