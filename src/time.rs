//! Monotonic time types shared by the timer scheduler, the event loop and
//! the Gattlink stall tracker. All of Golden Gate's timing is expressed in
//! milliseconds since an arbitrary epoch, matching the `GG_Timestamp`
//! convention of the original implementation and the `Instant`/`Duration`
//! split `tapip_rs::phy::Device` expects from callers of `receive`/`transmit`.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::SystemTime;

/// A point in monotonic time, in milliseconds.
#[derive(Debug, Default, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct Instant {
    millis: i64,
}

impl Instant {
    pub const ZERO: Instant = Instant::from_millis(0);

    pub const fn from_millis(millis: i64) -> Instant {
        Instant { millis }
    }

    pub const fn from_secs(secs: i64) -> Instant {
        Instant {
            millis: secs * 1000,
        }
    }

    /// The current wall-clock time, used by [`crate::event_loop::EventLoop::run`]
    /// to advance the timer scheduler. Not available in `const` contexts, unlike
    /// `ZERO`, since it reads the system clock.
    pub fn now() -> Instant {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        Instant::from_millis(now.as_millis() as i64)
    }

    pub const fn total_millis(&self) -> i64 {
        self.millis
    }

    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        if self.millis < earlier.millis {
            Duration::ZERO
        } else {
            Duration::from_millis((self.millis - earlier.millis) as u64)
        }
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.millis)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis + rhs.millis as i64)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.millis += rhs.millis as i64;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, rhs: Duration) -> Instant {
        Instant::from_millis(self.millis - rhs.millis as i64)
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;
    fn sub(self, rhs: Instant) -> Duration {
        self.saturating_duration_since(rhs)
    }
}

/// A length of monotonic time, in milliseconds. Always non-negative.
#[derive(Debug, Default, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct Duration {
    millis: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration::from_millis(0);

    pub const fn from_millis(millis: u64) -> Duration {
        Duration { millis }
    }

    pub const fn from_secs(secs: u64) -> Duration {
        Duration {
            millis: secs * 1000,
        }
    }

    pub const fn total_millis(&self) -> u64 {
        self.millis
    }

    pub fn saturating_add(self, rhs: Duration) -> Duration {
        Duration::from_millis(self.millis.saturating_add(rhs.millis))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.millis)
    }
}

impl Add for Duration {
    type Output = Duration;
    fn add(self, rhs: Duration) -> Duration {
        self.saturating_add(rhs)
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.millis = self.millis.saturating_add(rhs.millis);
    }
}

impl Sub for Duration {
    type Output = Duration;
    fn sub(self, rhs: Duration) -> Duration {
        Duration::from_millis(self.millis.saturating_sub(rhs.millis))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Duration) {
        self.millis = self.millis.saturating_sub(rhs.millis);
    }
}

impl From<std::time::Duration> for Duration {
    fn from(value: std::time::Duration) -> Duration {
        Duration::from_millis(value.as_millis() as u64)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> std::time::Duration {
        std::time::Duration::from_millis(value.millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_subtraction_saturates_at_zero() {
        let earlier = Instant::from_millis(100);
        let later = Instant::from_millis(40);
        assert_eq!(later.saturating_duration_since(earlier), Duration::ZERO);
        assert_eq!(
            earlier.saturating_duration_since(later),
            Duration::from_millis(60)
        );
    }

    #[test]
    fn duration_arithmetic() {
        let mut d = Duration::from_millis(100);
        d += Duration::from_millis(50);
        assert_eq!(d, Duration::from_millis(150));
        assert_eq!(d - Duration::from_millis(200), Duration::ZERO);
    }
}
