//! Injectable wall clock
//!
//! Expiry decisions are made against [`Clock::now`] rather than
//! `Utc::now()` directly so that renewal timing can be driven by Tokio's
//! paused test clock.

use chrono::{DateTime, Utc};

/// Source of the current UTC time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant as a UTC timestamp.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system's real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock that advances with Tokio's monotonic clock.
///
/// The clock captures a wall-clock base and a [`tokio::time::Instant`] at
/// construction and reports `base + elapsed`. Under `tokio::time::pause()`
/// it moves only when the runtime's time is advanced, which keeps token
/// expiry and the renewal timer on the same timeline.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use oidc_session::auth::clock::{AnchoredClock, Clock};
///
/// let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
/// let clock = AnchoredClock::starting_at(start);
/// assert!(clock.now() >= start);
/// ```
#[derive(Debug, Clone)]
pub struct AnchoredClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl AnchoredClock {
    /// Anchors the clock at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchors the clock at an explicit wall-clock time.
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for AnchoredClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base + elapsed
    }
}
