use std::sync::atomic::{AtomicI64, Ordering};

/// Source of modification timestamps.
///
/// Returns wall-clock milliseconds since the epoch, bumped past the previous
/// value whenever the wall clock has not advanced (or went backwards), so two
/// saves through the same clock never share an mtime.
#[derive(Debug, Default)]
pub struct MtimeClock {
    last: AtomicI64,
}

impl MtimeClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub fn next(&self) -> i64 {
        let now = Self::now_millis();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now.max(current + 1);
            match self
                .last
                .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }

    /// Last value handed out, or 0 before the first call.
    pub fn last(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}
