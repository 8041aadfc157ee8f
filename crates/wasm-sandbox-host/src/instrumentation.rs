//! Access to the instruction counter an instrumented guest maintains.
//!
//! Instrumented modules export two mutable `u64` globals, the running
//! counter and the threshold the entry point was started with. When the
//! counter passes the threshold the guest calls `sandbox_counter_exceeded`.

use tracing::debug;

use crate::abi;
use wasm_sandbox_common::RuntimeError;
use wasm_sandbox_core::{ModuleInstance, SharedHandle};

/// Snapshot of an instrumented instance's globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    /// Instructions counted so far.
    pub counter: u64,
    /// Threshold stored by the guest, if it exports one.
    pub threshold: Option<u64>,
}

impl Counters {
    /// Returns `true` if the counter is past a known threshold.
    pub fn exceeded(&self) -> bool {
        self.threshold.is_some_and(|threshold| self.counter > threshold)
    }
}

/// Read the counter global.
///
/// # Errors
///
/// Returns `Lookup` if the guest does not export it, `TypeMismatch` if it
/// is not an `i64` global.
pub fn read_counter(instance: &SharedHandle<ModuleInstance>) -> Result<u64, RuntimeError> {
    instance.get_global::<u64>(abi::COUNTER_GLOBAL)
}

/// Read both globals. A missing threshold global is not an error.
///
/// # Errors
///
/// Returns the errors of [`read_counter`].
pub fn read_counters(instance: &SharedHandle<ModuleInstance>) -> Result<Counters, RuntimeError> {
    let counter = read_counter(instance)?;
    let threshold = match instance.get_global::<u64>(abi::THRESHOLD_GLOBAL) {
        Ok(threshold) => Some(threshold),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };
    Ok(Counters { counter, threshold })
}

/// Zero the counter, and the threshold if the guest exports one.
///
/// # Errors
///
/// Returns `Lookup` if there is no counter global, `TypeMismatch` if a
/// global is immutable or not an `i64`.
pub fn reset_counters(instance: &SharedHandle<ModuleInstance>) -> Result<(), RuntimeError> {
    instance.set_global::<u64>(abi::COUNTER_GLOBAL, 0)?;

    match instance.set_global::<u64>(abi::THRESHOLD_GLOBAL, 0) {
        Err(e) if !e.is_not_found() => return Err(e),
        _ => {}
    }

    debug!(instance_id = %instance.id(), "Instrumentation counters reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::MonotonicClock;
    use crate::logging::CaptureSink;
    use wasm_sandbox_common::RuntimeConfig;
    use wasm_sandbox_core::{Module, Runtime};

    fn instance(wat: &str) -> SharedHandle<ModuleInstance> {
        let runtime = Runtime::create(
            &RuntimeConfig::default(),
            Arc::new(CaptureSink::new()),
            Arc::new(MonotonicClock::new()),
            &(),
        )
        .unwrap();
        let module = Module::from_wat(&runtime, wat).unwrap();
        module.instantiate(64 * 1024, 0).unwrap()
    }

    #[test]
    fn test_read_and_reset_counters() {
        let instance = instance(
            r#"(module
                (global (export "sandbox_counter") (mut i64) (i64.const 12))
                (global (export "sandbox_threshold") (mut i64) (i64.const 10)))"#,
        );

        let counters = read_counters(&instance).unwrap();
        assert_eq!(counters, Counters { counter: 12, threshold: Some(10) });
        assert!(counters.exceeded());

        reset_counters(&instance).unwrap();
        assert_eq!(read_counters(&instance).unwrap(), Counters { counter: 0, threshold: Some(0) });
    }

    #[test]
    fn test_threshold_global_is_optional() {
        let instance =
            instance(r#"(module (global (export "sandbox_counter") (mut i64) (i64.const 3)))"#);

        let counters = read_counters(&instance).unwrap();
        assert_eq!(counters.threshold, None);
        assert!(!counters.exceeded());

        reset_counters(&instance).unwrap();
        assert_eq!(read_counter(&instance).unwrap(), 0);
    }

    #[test]
    fn test_counter_width_checked() {
        let instance =
            instance(r#"(module (global (export "sandbox_counter") (mut i32) (i32.const 3)))"#);

        let err = read_counter(&instance).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_missing_counter() {
        let instance = instance("(module)");

        assert!(read_counter(&instance).unwrap_err().is_not_found());
        assert!(reset_counters(&instance).unwrap_err().is_not_found());
    }
}
