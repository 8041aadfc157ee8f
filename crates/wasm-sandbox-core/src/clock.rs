//! Timestamp source seam.

use std::fmt;

use wasm_sandbox_common::TimestampError;

/// Supplies microsecond timestamps to the benchmark callbacks.
///
/// Reading the clock may cross a privilege boundary, so it can fail.
pub trait TimestampSource: Send + Sync + fmt::Debug {
    /// Current time in microseconds, relative to a source-defined origin.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying clock cannot be read.
    fn now_us(&self) -> Result<u64, TimestampError>;
}
