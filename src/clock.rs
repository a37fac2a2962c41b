//! Time source consumed by the core.

use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall-clock UTC time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.  Used by tests, replays and
/// deterministic simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, ts: OffsetDateTime) {
        *self.now.lock() = ts;
    }

    pub fn advance(&self, by: Duration) -> OffsetDateTime {
        let mut now = self.now.lock();
        *now += by;
        *now
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn manual_clock_moves_only_on_demand() {
        let clock = ManualClock::new(datetime!(2025-06-01 12:00 UTC));
        assert_eq!(clock.now(), clock.now());
        let later = clock.advance(Duration::minutes(90));
        assert_eq!(later, datetime!(2025-06-01 13:30 UTC));
        clock.set(datetime!(2025-06-01 08:00 UTC));
        assert_eq!(clock.now(), datetime!(2025-06-01 08:00 UTC));
    }
}
