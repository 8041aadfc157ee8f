//! Timestamp sources.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use wasm_sandbox_common::TimestampError;
use wasm_sandbox_core::TimestampSource;

/// Microseconds since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// A clock starting at zero now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampSource for MonotonicClock {
    fn now_us(&self) -> Result<u64, TimestampError> {
        u64::try_from(self.origin.elapsed().as_micros()).map_err(|_| TimestampError::Unavailable {
            reason: "monotonic clock overflowed".to_string(),
        })
    }
}

/// Microseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimestampSource for SystemClock {
    fn now_us(&self) -> Result<u64, TimestampError> {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| TimestampError::BeforeEpoch)?;

        u64::try_from(since_epoch.as_micros()).map_err(|_| TimestampError::Unavailable {
            reason: "system clock overflowed".to_string(),
        })
    }
}
