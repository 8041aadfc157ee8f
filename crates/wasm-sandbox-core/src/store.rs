//! Per-instance store data and the exception latch.
//!
//! This module provides:
//! - [`ExecContext`]: State accessible from native callbacks through
//!   [`wasmtime::Caller`]
//! - [`Exception`]: The latched fault of an instance

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::arena::{ArenaLimiter, HeapArena};
use crate::clock::TimestampSource;
use crate::heap::GuestHeap;
use crate::sink::PrintSink;
use crate::user_data::UserData;
use wasm_sandbox_common::{FaultKind, TimestampError};

/// A latched instance fault.
///
/// Once set, the instance refuses further calls until the exception is
/// cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    /// Why the guest unwound.
    pub kind: FaultKind,
    /// Diagnostic text.
    pub message: String,
}

/// Store data of a module instance.
///
/// Native callbacks see this through `caller.data()` / `caller.data_mut()`.
/// It carries:
/// - the arena limiter charging linear memory growth
/// - the app-heap allocator (if the instance has one)
/// - the exception latch
/// - the `UserData` of the environment whose call is in flight
/// - the print sink and timestamp source of the runtime
pub struct ExecContext {
    pub(crate) limiter: ArenaLimiter,
    heap: Option<GuestHeap>,
    exception: Option<Exception>,
    active: Option<ActiveCall>,
    sink: Arc<dyn PrintSink>,
    clock: Arc<dyn TimestampSource>,
}

struct ActiveCall {
    environment: Uuid,
    user_data: UserData,
}

impl ExecContext {
    pub(crate) fn new(
        arena: Arc<HeapArena>,
        sink: Arc<dyn PrintSink>,
        clock: Arc<dyn TimestampSource>,
    ) -> Self {
        Self {
            limiter: ArenaLimiter::new(arena),
            heap: None,
            exception: None,
            active: None,
            sink,
            clock,
        }
    }

    /// Forward guest output to the print sink.
    pub fn print(&self, bytes: &[u8]) {
        self.sink.print(bytes);
    }

    /// Read the timestamp source.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read.
    pub fn now_us(&self) -> Result<u64, TimestampError> {
        self.clock.now_us()
    }

    /// `UserData` of the environment whose call is in flight.
    pub fn user_data(&self) -> Option<&UserData> {
        self.active.as_ref().map(|active| &active.user_data)
    }

    /// Mutable `UserData` of the environment whose call is in flight.
    pub fn user_data_mut(&mut self) -> Option<&mut UserData> {
        self.active.as_mut().map(|active| &mut active.user_data)
    }

    /// Id of the environment whose call is in flight.
    pub fn active_environment(&self) -> Option<Uuid> {
        self.active.as_ref().map(|active| active.environment)
    }

    /// The latched exception, if any.
    pub fn exception(&self) -> Option<&Exception> {
        self.exception.as_ref()
    }

    /// Latch an exception, replacing any previous one.
    pub fn set_exception(&mut self, kind: FaultKind, message: impl Into<String>) {
        let message = message.into();
        debug!(%kind, %message, "Exception latched");
        self.exception = Some(Exception { kind, message });
    }

    /// Clear the latch, returning what was set.
    pub fn clear_exception(&mut self) -> Option<Exception> {
        self.exception.take()
    }

    /// Latch an exception and produce the error a native callback returns
    /// to unwind the guest.
    pub fn raise(&mut self, kind: FaultKind, message: impl Into<String>) -> wasmtime::Error {
        let message = message.into();
        self.set_exception(kind, message.clone());
        wasmtime::Error::msg(message)
    }

    /// Latch a failed invocation.
    ///
    /// A kind already latched by a native callback wins; otherwise the
    /// failure is a plain trap described by its root cause.
    pub(crate) fn latch_failure(&mut self, error: &wasmtime::Error) -> Exception {
        if let Some(exception) = &self.exception {
            return exception.clone();
        }

        let exception = Exception {
            kind: FaultKind::Trap,
            message: error.root_cause().to_string(),
        };
        debug!(message = %exception.message, "Trap latched");
        self.exception = Some(exception.clone());
        exception
    }

    pub(crate) fn lend(&mut self, environment: Uuid, user_data: UserData) {
        self.active = Some(ActiveCall {
            environment,
            user_data,
        });
    }

    pub(crate) fn reclaim(&mut self) -> Option<UserData> {
        self.active.take().map(|active| active.user_data)
    }

    pub(crate) fn heap(&self) -> Option<&GuestHeap> {
        self.heap.as_ref()
    }

    pub(crate) fn heap_mut(&mut self) -> Option<&mut GuestHeap> {
        self.heap.as_mut()
    }

    pub(crate) fn install_heap(&mut self, heap: GuestHeap) {
        self.heap = Some(heap);
    }

    /// Bytes of linear memory charged to the arena by this instance.
    pub fn memory_charged(&self) -> u64 {
        self.limiter.charged()
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("exception", &self.exception)
            .field("active_environment", &self.active_environment())
            .field("memory_charged", &self.memory_charged())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedClock, NullSink};

    fn context() -> ExecContext {
        let arena = HeapArena::new(1024).unwrap();
        ExecContext::new(arena, Arc::new(NullSink), Arc::new(FixedClock(7)))
    }

    #[test]
    fn test_exception_latch() {
        let mut ctx = context();
        assert!(ctx.exception().is_none());

        let err = ctx.raise(FaultKind::Exit(2), "guest exit");
        assert_eq!(err.to_string(), "guest exit");
        assert_eq!(ctx.exception().unwrap().kind, FaultKind::Exit(2));

        let cleared = ctx.clear_exception().unwrap();
        assert_eq!(cleared.message, "guest exit");
        assert!(ctx.exception().is_none());
    }

    #[test]
    fn test_latch_failure_keeps_callback_kind() {
        let mut ctx = context();
        let err = ctx.raise(FaultKind::CounterExceeded, "threshold");

        let latched = ctx.latch_failure(&err);
        assert_eq!(latched.kind, FaultKind::CounterExceeded);
        assert_eq!(latched.message, "threshold");
    }

    #[test]
    fn test_latch_failure_defaults_to_trap() {
        let mut ctx = context();
        let err = wasmtime::Error::msg("unreachable executed");

        let latched = ctx.latch_failure(&err);
        assert_eq!(latched.kind, FaultKind::Trap);
        assert_eq!(latched.message, "unreachable executed");
        assert!(ctx.exception().is_some());
    }

    #[test]
    fn test_lend_and_reclaim() {
        let mut ctx = context();
        assert!(ctx.user_data().is_none());

        let id = Uuid::new_v4();
        ctx.lend(id, UserData::with_event("id", "payload").unwrap());
        assert_eq!(ctx.active_environment(), Some(id));
        let now = ctx.now_us().unwrap();
        ctx.user_data_mut().unwrap().set_start_time_us(now);

        let data = ctx.reclaim().unwrap();
        assert_eq!(data.start_time_us(), 7);
        assert!(ctx.active_environment().is_none());
    }
}
