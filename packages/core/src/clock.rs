// ABOUTME: Monotonic UTC clock for envelope and rollup timestamps
// ABOUTME: Never goes backwards even if the wall clock steps back

use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Process-wide timestamp source. `createdAt` sequences written through one
/// clock are non-decreasing; ties are allowed.
#[derive(Debug)]
pub struct MonotonicClock {
    last: Mutex<DateTime<Utc>>,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now();
        let mut last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let stamped = if wall > *last { wall } else { *last };
        *last = stamped;
        stamped
    }
}
