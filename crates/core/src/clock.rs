use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock at nanosecond resolution that never hands out the same or an earlier
/// instant twice, even if the system clock steps backwards.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_nanos: AtomicI64,
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut previous = self.last_nanos.load(Ordering::Relaxed);
        loop {
            let next = wall.max(previous.saturating_add(1));
            match self.last_nanos.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return DateTime::<Utc>::from_timestamp_nanos(next),
                Err(observed) => previous = observed,
            }
        }
    }
}
