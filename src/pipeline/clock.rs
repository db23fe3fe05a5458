use std::sync::Mutex;

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};

/// Source of "now". Sessions and triage times are kept in clinic-local
/// wall time, audit stamps in UTC; the clock provides both.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn offset(&self) -> FixedOffset;

    fn local_now(&self) -> NaiveDateTime {
        self.now().with_timezone(&self.offset()).naive_local()
    }
}

pub struct SystemClock {
    offset: FixedOffset,
}

impl SystemClock {
    /// Falls back to UTC when the offset is out of range.
    pub fn new(utc_offset_minutes: i32) -> Self {
        let offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix());
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

/// Manually advanced clock for tests and replays.
pub struct FixedClock {
    at: Mutex<DateTime<Utc>>,
    offset: FixedOffset,
}

impl FixedClock {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at: Mutex::new(at),
            offset: Utc.fix(),
        }
    }

    /// A UTC clock whose local time is `local`.
    pub fn at_local(local: NaiveDateTime) -> Self {
        Self::at(Utc.from_utc_datetime(&local))
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut at) = self.at.lock() {
            *at += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.at.lock() {
            Ok(at) => *at,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn offset(&self) -> FixedOffset {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn local_now_applies_offset() {
        let clock = SystemClock::new(-180);
        let utc = clock.now();
        let local = clock.local_now();
        let diff = utc.naive_utc() - local;
        assert!((diff - Duration::hours(3)).num_seconds().abs() <= 1);
    }

    #[test]
    fn out_of_range_offset_falls_back_to_utc() {
        assert_eq!(SystemClock::new(i32::MAX).offset(), Utc.fix());
        assert_eq!(SystemClock::new(i32::MIN).offset(), Utc.fix());
        assert_eq!(SystemClock::new(24 * 60).offset(), Utc.fix());
    }

    #[test]
    fn fixed_clock_advances() {
        let local = NaiveDate::from_ymd_opt(2025, 3, 3)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let clock = FixedClock::at_local(local);
        assert_eq!(clock.local_now(), local);
        clock.advance(Duration::days(1));
        assert_eq!(clock.local_now(), local + Duration::days(1));
    }
}
