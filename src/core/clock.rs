//! Wall-clock helpers shared by the event queue and check results.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unix time in whole seconds.
pub type Timestamp = i64;

/// Current unix time in seconds.
#[must_use]
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// Seconds plus microseconds, the precision check timings are recorded at.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

impl Timeval {
    pub const ZERO: Self = Self { sec: 0, usec: 0 };

    #[must_use]
    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            sec: now.timestamp(),
            usec: i64::from(now.timestamp_subsec_micros()),
        }
    }

    #[must_use]
    pub const fn from_secs(sec: i64) -> Self {
        Self { sec, usec: 0 }
    }

    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                usec: i64::from(d.subsec_micros()),
            },
            Err(_) => Self::ZERO,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs_f64(self) -> f64 {
        self.sec as f64 + self.usec as f64 / 1_000_000.0
    }

    /// Seconds elapsed from `earlier` to `self`, negative when `self` is older.
    #[must_use]
    pub fn seconds_since(self, earlier: Self) -> f64 {
        self.as_secs_f64() - earlier.as_secs_f64()
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// Parse `seconds[.microseconds]`.
    ///
    /// The fractional part is read as an integer microsecond count, so
    /// `"1000.5"` is 1000 s + 5 µs and `"1000.500000"` is 1000.5 s.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (sec, usec) = match raw.split_once('.') {
            Some((sec, usec)) => (sec, usec),
            None => (raw, ""),
        };
        let sec = sec.parse::<i64>().ok()?;
        let usec = if usec.is_empty() {
            0
        } else {
            usec.parse::<i64>().ok()?
        };
        if usec < 0 {
            return None;
        }
        Some(Self {
            sec: sec.saturating_add(usec / 1_000_000),
            usec: usec % 1_000_000,
        })
    }
}

impl fmt::Display for Timeval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_whole_and_fractional_seconds() {
        assert_eq!(Timeval::parse("1000.0"), Some(Timeval::from_secs(1000)));
        assert_eq!(Timeval::parse("1000"), Some(Timeval::from_secs(1000)));
        assert_eq!(
            Timeval::parse("1000.500000"),
            Some(Timeval {
                sec: 1000,
                usec: 500_000
            })
        );
        assert_eq!(Timeval::parse(" 12.5 "), Some(Timeval { sec: 12, usec: 5 }));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(Timeval::parse("soon"), None);
        assert_eq!(Timeval::parse("10.x"), None);
        assert_eq!(Timeval::parse(""), None);
    }

    #[test]
    fn display_round_trips_through_parse() {
        let tv = Timeval {
            sec: 1_700_000_000,
            usec: 42,
        };
        assert_eq!(tv.to_string(), "1700000000.000042");
        assert_eq!(Timeval::parse(&tv.to_string()), Some(tv));
    }

    #[test]
    fn seconds_since_is_signed() {
        let a = Timeval { sec: 10, usec: 0 };
        let b = Timeval {
            sec: 12,
            usec: 500_000,
        };
        assert!((b.seconds_since(a) - 2.5).abs() < 1e-9);
        assert!((a.seconds_since(b) + 2.5).abs() < 1e-9);
    }
}
