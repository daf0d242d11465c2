use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// A point in time with nanosecond precision, independent of time zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let carry = nanos.div_euclid(1_000_000_000);
        Self {
            seconds: seconds + carry as i64,
            nanos: nanos.rem_euclid(1_000_000_000),
        }
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(duration) => Self::new(duration.as_secs() as i64, duration.subsec_nanos() as i32),
            Err(err) => {
                let duration = err.duration();
                Self::new(
                    -(duration.as_secs() as i64),
                    -(duration.subsec_nanos() as i32),
                )
            }
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as i32,
        )
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + (self.nanos / 1_000) as i64
    }

    /// Elapsed time from `earlier` to `self`, saturating at zero.
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        let micros = self.to_micros() - earlier.to_micros();
        Duration::from_micros(micros.max(0) as u64)
    }

    pub fn to_rfc3339(&self) -> String {
        Utc.timestamp_opt(self.seconds, self.nanos as u32)
            .single()
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    pub fn parse_rfc3339(value: &str) -> FirestoreResult<Self> {
        let parsed = DateTime::parse_from_rfc3339(value)
            .map_err(|err| invalid_argument(format!("Invalid timestamp {value}: {err}")))?
            .with_timezone(&Utc);
        Ok(Self::new(parsed.timestamp(), parsed.timestamp_subsec_nanos() as i32))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then(self.nanos.cmp(&other.nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_nanoseconds() {
        let timestamp = Timestamp::new(1, 1_500_000_000);
        assert_eq!((timestamp.seconds, timestamp.nanos), (2, 500_000_000));
        let negative = Timestamp::new(1, -1);
        assert_eq!((negative.seconds, negative.nanos), (0, 999_999_999));
    }

    #[test]
    fn orders_by_seconds_then_nanos() {
        assert!(Timestamp::new(1, 5) < Timestamp::new(2, 0));
        assert!(Timestamp::new(2, 0) < Timestamp::new(2, 1));
    }

    #[test]
    fn rfc3339_roundtrip() {
        let timestamp = Timestamp::new(1_700_000_000, 123_000_000);
        let rendered = timestamp.to_rfc3339();
        assert_eq!(Timestamp::parse_rfc3339(&rendered).unwrap(), timestamp);
    }

    #[test]
    fn measures_elapsed_time() {
        let earlier = Timestamp::new(10, 0);
        let later = Timestamp::new(310, 0);
        assert_eq!(later.duration_since(&earlier), Duration::from_secs(300));
        assert_eq!(earlier.duration_since(&later), Duration::ZERO);
    }
}
