//! Per-environment state visible to native callbacks.

use wasm_sandbox_common::RuntimeError;

/// State an execution environment carries across guest calls.
///
/// While a call is in flight the environment lends its `UserData` to the
/// instance's store, where native callbacks reach it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserData {
    start_time_us: u64,
    instruction_count: u64,
    threshold_exceeded: bool,
    event_id: Vec<u8>,
    event_payload: Vec<u8>,
}

impl UserData {
    /// Empty user data.
    pub fn new() -> Self {
        Self::default()
    }

    /// User data carrying an event.
    ///
    /// # Errors
    ///
    /// Returns `Allocation` if either buffer is longer than a 32-bit guest
    /// can address.
    pub fn with_event(
        event_id: impl Into<Vec<u8>>,
        event_payload: impl Into<Vec<u8>>,
    ) -> Result<Self, RuntimeError> {
        let mut data = Self::new();
        data.set_event_id(event_id)?;
        data.set_event_payload(event_payload)?;
        Ok(data)
    }

    /// Timestamp recorded by the last benchmark start, in microseconds.
    pub fn start_time_us(&self) -> u64 {
        self.start_time_us
    }

    /// Record the benchmark start time.
    pub fn set_start_time_us(&mut self, start_time_us: u64) {
        self.start_time_us = start_time_us;
    }

    /// Instruction count recorded when the threshold fired.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Returns `true` once the instrumentation threshold has fired.
    pub fn threshold_exceeded(&self) -> bool {
        self.threshold_exceeded
    }

    /// Record that the threshold fired at `instruction_count`.
    pub fn record_threshold_exceeded(&mut self, instruction_count: u64) {
        self.instruction_count = instruction_count;
        self.threshold_exceeded = true;
    }

    /// Clear the instrumentation state before a new run.
    pub fn reset_instrumentation(&mut self) {
        self.instruction_count = 0;
        self.threshold_exceeded = false;
    }

    /// Event identifier bytes.
    pub fn event_id(&self) -> &[u8] {
        &self.event_id
    }

    /// Event payload bytes.
    pub fn event_payload(&self) -> &[u8] {
        &self.event_payload
    }

    /// Length of the event identifier as the guest sees it.
    pub fn event_id_len(&self) -> u32 {
        guest_len(&self.event_id)
    }

    /// Length of the event payload as the guest sees it.
    pub fn event_payload_len(&self) -> u32 {
        guest_len(&self.event_payload)
    }

    /// Replace the event identifier.
    ///
    /// # Errors
    ///
    /// Returns `Allocation` if `event_id` exceeds `u32::MAX` bytes.
    pub fn set_event_id(&mut self, event_id: impl Into<Vec<u8>>) -> Result<(), RuntimeError> {
        self.event_id = check_guest_len(event_id.into(), "event id")?;
        Ok(())
    }

    /// Replace the event payload.
    ///
    /// # Errors
    ///
    /// Returns `Allocation` if `event_payload` exceeds `u32::MAX` bytes.
    pub fn set_event_payload(
        &mut self,
        event_payload: impl Into<Vec<u8>>,
    ) -> Result<(), RuntimeError> {
        self.event_payload = check_guest_len(event_payload.into(), "event payload")?;
        Ok(())
    }
}

fn check_guest_len(bytes: Vec<u8>, what: &str) -> Result<Vec<u8>, RuntimeError> {
    if u32::try_from(bytes.len()).is_err() {
        return Err(RuntimeError::allocation(
            bytes.len() as u64,
            format!("{what} does not fit a 32-bit guest"),
        ));
    }
    Ok(bytes)
}

// Lengths are checked on the way in.
fn guest_len(bytes: &[u8]) -> u32 {
    u32::try_from(bytes.len()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_event() {
        let data = UserData::with_event("event-0", "EventMessage").unwrap();

        assert_eq!(data.event_id(), b"event-0");
        assert_eq!(data.event_id_len(), 7);
        assert_eq!(data.event_payload(), b"EventMessage");
        assert_eq!(data.event_payload_len(), 12);
        assert!(!data.threshold_exceeded());
    }

    #[test]
    fn test_instrumentation_state() {
        let mut data = UserData::new();

        data.set_start_time_us(42);
        data.record_threshold_exceeded(1_000);
        assert_eq!(data.start_time_us(), 42);
        assert_eq!(data.instruction_count(), 1_000);
        assert!(data.threshold_exceeded());

        data.reset_instrumentation();
        assert_eq!(data.instruction_count(), 0);
        assert!(!data.threshold_exceeded());
        // Start time is not instrumentation state
        assert_eq!(data.start_time_us(), 42);
    }

    #[test]
    fn test_empty_event() {
        let data = UserData::new();
        assert_eq!(data.event_id_len(), 0);
        assert!(data.event_payload().is_empty());
    }
}
