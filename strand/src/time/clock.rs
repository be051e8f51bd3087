//! Clock definitions for the timer [`Scheduler`](super::Scheduler).
//!
//! A [`Clock`] is a function returning the current timestamp in [`Ticks`],
//! plus the [`Duration`] one tick represents. The scheduler works entirely
//! in ticks, so deterministic tests can drive it from a plain atomic counter
//! while production code uses [`Clock::system`].

use core::fmt;
use core::time::Duration;
use std::sync::OnceLock;

/// Timestamps are counted in 64-bit ticks.
pub type Ticks = u64;

/// A time source definition.
///
/// The `now` function must be monotonically non-decreasing. For a test
/// clock, point it at a static atomic:
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
/// use std::time::Duration;
/// use strand::time::Clock;
///
/// static NOW: AtomicU64 = AtomicU64::new(0);
///
/// let clock = Clock::new(Duration::from_millis(1), || NOW.load(Relaxed))
///     .named("test-clock");
/// NOW.store(10, Relaxed);
/// assert_eq!(clock.now_ticks(), 10);
/// ```
#[derive(Clone)]
pub struct Clock {
    now: fn() -> Ticks,
    tick_duration: Duration,
    name: &'static str,
}

impl Clock {
    /// Returns a new clock with the given tick duration and `now` function.
    ///
    /// # Panics
    ///
    /// Panics if `tick_duration` is zero.
    #[must_use]
    pub fn new(tick_duration: Duration, now: fn() -> Ticks) -> Self {
        assert!(
            tick_duration > Duration::ZERO,
            "tick duration must be non-zero"
        );
        Self {
            now,
            tick_duration,
            name: "<unnamed clock>",
        }
    }

    /// The process-monotonic wall clock, with nanosecond ticks.
    ///
    /// Tick zero is the first moment this clock (any instance of it) was
    /// consulted.
    #[must_use]
    pub fn system() -> Self {
        fn system_now() -> Ticks {
            static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
            let epoch = *EPOCH.get_or_init(std::time::Instant::now);
            epoch.elapsed().as_nanos().try_into().unwrap_or(Ticks::MAX)
        }
        // Touch the epoch now, so tick zero predates every later reading.
        let _ = system_now();
        Clock::new(Duration::from_nanos(1), system_now).named("system-monotonic")
    }

    /// Attaches a name, shown in `fmt::Debug` output.
    #[must_use]
    pub const fn named(self, name: &'static str) -> Self {
        Self { name, ..self }
    }

    /// Returns the current timestamp in ticks.
    #[must_use]
    pub fn now_ticks(&self) -> Ticks {
        (self.now)()
    }

    /// The duration of a single tick.
    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// This clock's name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Converts a duration to ticks, rounding down and saturating.
    pub(crate) fn dur_to_ticks(&self, dur: Duration) -> Ticks {
        (dur.as_nanos() / self.tick_duration.as_nanos())
            .try_into()
            .unwrap_or(Ticks::MAX)
    }

    /// Converts a tick count to a duration, saturating on overflow.
    pub(crate) fn ticks_to_dur(&self, ticks: Ticks) -> Duration {
        const NANOS_PER_SEC: u64 = 1_000_000_000;
        // Nanosecond part multiplied as u64 cannot overflow.
        let total_nanos = u64::from(self.tick_duration.subsec_nanos()) as u128 * ticks as u128;
        let extra_secs = (total_nanos / NANOS_PER_SEC as u128) as u64;
        let nanos = (total_nanos % NANOS_PER_SEC as u128) as u32;
        let secs = self
            .tick_duration
            .as_secs()
            .checked_mul(ticks)
            .and_then(|secs| secs.checked_add(extra_secs));
        match secs {
            Some(secs) => Duration::new(secs, nanos),
            None => Duration::MAX,
        }
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("name", &self.name)
            .field("tick_duration", &self.tick_duration)
            .finish()
    }
}
