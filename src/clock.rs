//! Time keeping for a recording run.
//!
//! The controller measures poll deadlines, stop timers and the grace period
//! on a monotonic [`Clock`], while segment names come from the same clock's
//! wall reading. [`SystemClock`] backs real runs; [`ManualClock`] jumps to
//! each deadline so simulated runs finish instantly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A point on a clock's timeline, or a span between two points, in
/// nanoseconds.
///
/// Arithmetic clamps instead of wrapping: `a - b` is zero when `b > a`.
///
/// ```rust
/// use mediarig::clock::ClockTime;
///
/// let stop = ClockTime::from_secs(40);
/// let drained = stop + ClockTime::from_millis(500);
/// assert_eq!(drained.millis(), 40_500);
/// assert_eq!(drained.to_string(), "40.500s");
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime(u64);

impl ClockTime {
    /// The clock's epoch.
    pub const ZERO: Self = Self(0);

    /// From nanoseconds.
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// From milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    /// From whole seconds.
    pub const fn from_secs(s: u64) -> Self {
        Self(s.saturating_mul(1_000_000_000))
    }

    /// Nanoseconds.
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Whole milliseconds, rounded down.
    pub const fn millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Sum, clamped at the largest value.
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Difference, clamped at zero.
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Add for ClockTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl std::ops::AddAssign for ClockTime {
    fn add_assign(&mut self, rhs: Self) {
        *self = self.saturating_add(rhs);
    }
}

impl std::ops::Sub for ClockTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl From<Duration> for ClockTime {
    fn from(d: Duration) -> Self {
        Self(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl From<ClockTime> for Duration {
    fn from(t: ClockTime) -> Self {
        Duration::from_nanos(t.0)
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:03}s", self.0 / 1_000_000_000, self.millis() % 1000)
    }
}

// ============================================================================
// Clock Trait
// ============================================================================

/// A clock shared by the engine and the lifecycle controller.
///
/// `now` is monotonic and drives poll deadlines and grace periods.
/// `unix_millis` is the wall-clock reading used to name segments.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic time since the clock's epoch.
    fn now(&self) -> ClockTime;

    /// Wall-clock time in milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;

    /// Block until `now() >= deadline`.
    fn sleep_until(&self, deadline: ClockTime);

    /// Human-readable name for logs.
    fn name(&self) -> &str {
        "unknown"
    }
}

// ============================================================================
// SystemClock
// ============================================================================

/// Real time. `now` counts from construction, `unix_millis` reads the
/// system wall clock.
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Start counting from now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> ClockTime {
        ClockTime::from(self.epoch.elapsed())
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    fn sleep_until(&self, deadline: ClockTime) {
        let now = self.now();
        if deadline > now {
            std::thread::sleep(Duration::from(deadline - now));
        }
    }

    fn name(&self) -> &str {
        "system-monotonic"
    }
}

// ============================================================================
// ManualClock
// ============================================================================

/// A clock that only moves when told to.
///
/// `sleep_until` jumps straight to the deadline, so a run that would take
/// minutes of wall time completes instantly and deterministically. The wall
/// reading is `unix_base_ms + now().millis()`.
///
/// ```rust
/// use mediarig::clock::{Clock, ClockTime, ManualClock};
///
/// let clock = ManualClock::new(0);
/// clock.sleep_until(ClockTime::from_millis(15_000));
/// assert_eq!(clock.unix_millis(), 15_000);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
    unix_base_ms: u64,
}

impl ManualClock {
    /// Create a manual clock at zero whose wall reading starts at `unix_base_ms`.
    pub fn new(unix_base_ms: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(0),
            unix_base_ms,
        }
    }

    /// Advance by `delta`.
    pub fn advance(&self, delta: ClockTime) {
        self.now_ns.fetch_add(delta.nanos(), Ordering::AcqRel);
    }

    /// Move to `t` if it is in the future. Time never goes backwards.
    pub fn set(&self, t: ClockTime) {
        self.now_ns.fetch_max(t.nanos(), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> ClockTime {
        ClockTime::from_nanos(self.now_ns.load(Ordering::Acquire))
    }

    fn unix_millis(&self) -> u64 {
        self.unix_base_ms + self.now().millis()
    }

    fn sleep_until(&self, deadline: ClockTime) {
        self.set(deadline);
    }

    fn name(&self) -> &str {
        "manual"
    }
}
