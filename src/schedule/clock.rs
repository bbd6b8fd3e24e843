//! Trait abstraction for the wall clock to enable testing

use chrono::{DateTime, Utc};

/// Wall clock that may not be synchronised yet
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Unix time the clock must be past before it is trusted
    fn trusted_after(&self) -> i64;

    /// Whether the clock has been synchronised
    fn is_trusted(&self) -> bool {
        self.now().timestamp() > self.trusted_after()
    }
}

/// Operating system clock
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    trusted_after: i64,
}

impl SystemClock {
    /// Create a clock trusted once unix time passes `trusted_after`
    pub fn new(trusted_after: i64) -> Self {
        Self { trusted_after }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn trusted_after(&self) -> i64 {
        self.trusted_after
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use chrono::Duration;
    use std::sync::{Arc, Mutex};

    /// Manually driven clock
    #[derive(Clone)]
    pub struct MockClock {
        now: Arc<Mutex<DateTime<Utc>>>,
        trusted_after: i64,
    }

    impl MockClock {
        pub fn new(now: DateTime<Utc>) -> Self {
            Self {
                now: Arc::new(Mutex::new(now)),
                trusted_after: 1_577_836_800,
            }
        }

        pub fn set(&self, now: DateTime<Utc>) {
            *self.now.lock().unwrap() = now;
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        fn trusted_after(&self) -> i64 {
            self.trusted_after
        }
    }
}
