use parking_lot::Mutex;
use time::OffsetDateTime;

/// Wall-clock source for expiry and lease decisions.
///
/// Production code uses [`SystemClock`]; tests inject [`ManualClock`] so
/// expiry comparisons are deterministic.
pub trait Clock: Send + Sync + 'static {
    /// Current UTC time.
    fn now(&self) -> OffsetDateTime;
}

/// Clock backed by the operating system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new(at: OffsetDateTime) -> Self {
        Self { now: Mutex::new(at) }
    }

    /// Clock starting at the given epoch milliseconds (falls back to the epoch).
    #[must_use]
    pub fn at_epoch_ms(ms: i64) -> Self {
        Self::new(from_epoch_ms(ms).unwrap_or(OffsetDateTime::UNIX_EPOCH))
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: time::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

/// Milliseconds since the Unix epoch, the unit of the `expires-at` cookie.
#[must_use]
pub fn epoch_ms(at: OffsetDateTime) -> i64 {
    i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

/// Inverse of [`epoch_ms`]; `None` when the value is out of range.
#[must_use]
pub fn from_epoch_ms(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_ms_roundtrip_keeps_millisecond_precision() {
        let ms = 1_760_000_000_123;
        let at = from_epoch_ms(ms).unwrap();
        assert_eq!(epoch_ms(at), ms);
    }

    #[test]
    fn out_of_range_epoch_is_rejected() {
        assert!(from_epoch_ms(i64::MAX).is_none());
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at_epoch_ms(1_000);
        clock.advance(time::Duration::seconds(2));
        assert_eq!(epoch_ms(clock.now()), 3_000);
    }
}
