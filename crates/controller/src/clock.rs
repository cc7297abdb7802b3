//! Clock abstraction so schedulers and executors can be driven by a
//! virtual clock in tests. All time flows through this trait: `now()`
//! for wall-clock decisions, `sleep()` for every timed wait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};

/// Source of wall-clock time and timed waits.
#[async_trait]
pub trait Clock: Clone + Send + Sync + 'static {
    /// Current local wall-clock time.
    fn now(&self) -> NaiveDateTime;

    /// Suspend the calling worker for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real system clock backed by the local timezone and tokio timers.
#[derive(Clone, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
pub mod testing {
    //! Settable clock for `#[tokio::test(start_paused = true)]` tests.
    //! `now()` is derived from the tokio virtual clock, so every
    //! `sleep` in the system advances wall-clock time deterministically.

    use super::*;
    use tokio::time::Instant;

    #[derive(Clone)]
    pub struct TestClock {
        origin: NaiveDateTime,
        started: Instant,
    }

    impl TestClock {
        /// Clock whose `now()` starts at the given local time, e.g.
        /// `TestClock::starting_at("2024-06-01 13:59:58")`.
        pub fn starting_at(origin: &str) -> Self {
            let origin = NaiveDateTime::parse_from_str(origin, "%Y-%m-%d %H:%M:%S")
                .expect("test clock origin must be YYYY-MM-DD HH:MM:SS");
            Self {
                origin,
                started: Instant::now(),
            }
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn now(&self) -> NaiveDateTime {
            self.origin + chrono::Duration::from_std(self.started.elapsed()).expect("elapsed fits")
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TestClock;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_advances_with_virtual_time() {
        let clock = TestClock::starting_at("2024-06-01 13:59:58");
        assert_eq!(clock.now().to_string(), "2024-06-01 13:59:58");

        clock.sleep(Duration::from_secs(2)).await;
        assert_eq!(clock.now().to_string(), "2024-06-01 14:00:00");

        clock.sleep(Duration::from_secs(3600)).await;
        assert_eq!(clock.now().to_string(), "2024-06-01 15:00:00");
    }

    #[test]
    fn system_clock_returns_plausible_time() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
