use core::fmt;
use core::ops::Add;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A point on the simulation's logical clock, in nanoseconds since the epoch.
///
/// Virtual time only moves when the [`Scheduler`](crate::scheduler::Scheduler)
/// advances it. [`VirtualTime::NEVER`] is reserved to mean "unscheduled" and is
/// never a valid instant to schedule at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualTime(i64);

impl VirtualTime {
    pub const ZERO: VirtualTime = VirtualTime(0);
    pub const NEVER: VirtualTime = VirtualTime(i64::MIN);

    pub const fn from_nanos(nanos: i64) -> Self {
        VirtualTime(nanos)
    }

    pub const fn from_micros(micros: i64) -> Self {
        VirtualTime(micros * 1_000)
    }

    pub const fn from_millis(millis: i64) -> Self {
        VirtualTime(millis * 1_000_000)
    }

    pub const fn nanos(self) -> i64 {
        self.0
    }

    pub const fn is_never(self) -> bool {
        self.0 == i64::MIN
    }

    /// Adds `offset`, returning `None` on overflow or if the result would land on
    /// the sentinel.
    pub fn checked_add(self, offset: Duration) -> Option<VirtualTime> {
        if self.is_never() {
            return None;
        }
        let offset = i64::try_from(offset.as_nanos()).ok()?;
        let nanos = self.0.checked_add(offset)?;
        if nanos == i64::MIN {
            None
        } else {
            Some(VirtualTime(nanos))
        }
    }

}

impl Add<Duration> for VirtualTime {
    type Output = VirtualTime;

    fn add(self, offset: Duration) -> VirtualTime {
        match self.checked_add(offset) {
            Some(t) => t,
            None => panic!("virtual time overflow: {} + {:?}", self, offset),
        }
    }
}

impl fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return write!(f, "never");
        }
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:09}s", sign, abs / 1_000_000_000, abs % 1_000_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_sorts_before_everything() {
        assert!(VirtualTime::NEVER < VirtualTime::ZERO);
        assert!(VirtualTime::NEVER.is_never());
        assert!(!VirtualTime::ZERO.is_never());
    }

    #[test]
    fn test_add_duration() {
        let t = VirtualTime::from_millis(3) + Duration::from_micros(250);
        assert_eq!(t.nanos(), 3_250_000);
    }

    #[test]
    fn test_checked_add_detects_overflow() {
        let late = VirtualTime::from_nanos(i64::MAX - 5);
        assert!(late.checked_add(Duration::from_nanos(10)).is_none());
        assert!(VirtualTime::NEVER.checked_add(Duration::from_nanos(1)).is_none());
    }

    #[test]
    #[should_panic(expected = "virtual time overflow")]
    fn test_add_overflow_is_fatal() {
        let _ = VirtualTime::from_nanos(i64::MAX) + Duration::from_nanos(1);
    }

    #[test]
    fn test_display() {
        assert_eq!(VirtualTime::from_millis(1500).to_string(), "1.500000000s");
        assert_eq!(VirtualTime::NEVER.to_string(), "never");
    }
}
