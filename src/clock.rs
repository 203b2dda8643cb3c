use std::time::Instant;

/// Source of record timestamps, in microseconds.
///
/// A record logged with timestamp 0 is stamped with `get_time()` instead,
/// so 0 can never be written as a literal timestamp.
pub trait TimeProvider {
    fn get_time(&self) -> i64;
}

/// Microseconds elapsed since the clock was created.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        MonotonicClock {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for MonotonicClock {
    fn get_time(&self) -> i64 {
        // 0 is reserved to mean "stamp with the current time"
        let micros = Instant::now().duration_since(self.start).as_micros();
        i64::try_from(micros).unwrap_or(i64::MAX).max(1)
    }
}

impl<T: TimeProvider + ?Sized> TimeProvider for std::sync::Arc<T> {
    fn get_time(&self) -> i64 {
        (**self).get_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_is_nonzero_and_non_decreasing() {
        let clock = MonotonicClock::new();
        let first = clock.get_time();
        let second = clock.get_time();
        assert!(first >= 1);
        assert!(second >= first);
    }
}
