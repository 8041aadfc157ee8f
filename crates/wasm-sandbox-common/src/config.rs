//! Configuration structures for wasm-sandbox.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Arena size, engine limits and default resource sizes
//! - [`ModuleConfig`]: Per-instance stack and app-heap sizes
//! - [`RunConfig`]: What the orchestration layer feeds the guest entry points

use serde::{Deserialize, Serialize};

/// Runtime configuration.
///
/// Every VM-side allocation (bytecode copies, stacks, linear memory) is
/// charged against `heap_size_bytes`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Size of the heap arena backing the runtime, in bytes.
    #[serde(default = "defaults::heap_size_bytes")]
    pub heap_size_bytes: u64,

    /// Maximum native stack a guest call may use, in bytes.
    ///
    /// Execution environments cannot request more than this.
    #[serde(default = "defaults::max_wasm_stack")]
    pub max_wasm_stack: u32,

    /// Largest bytecode buffer accepted by `Module::load`, in bytes.
    #[serde(default = "defaults::max_bytecode_size")]
    pub max_bytecode_size: u64,

    /// Default sizes for module instances.
    #[serde(default)]
    pub module: ModuleConfig,

    /// Default stack size for execution environments, in bytes.
    #[serde(default = "defaults::exec_stack_size")]
    pub exec_stack_size: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heap_size_bytes: defaults::heap_size_bytes(),
            max_wasm_stack: defaults::max_wasm_stack(),
            max_bytecode_size: defaults::max_bytecode_size(),
            module: ModuleConfig::default(),
            exec_stack_size: defaults::exec_stack_size(),
        }
    }
}

/// Module instance sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleConfig {
    /// Stack reservation per instance, in bytes.
    #[serde(default = "defaults::module_stack_size")]
    pub stack_size: u32,

    /// App heap appended to the instance's linear memory, in bytes.
    ///
    /// Host-side guest allocations are served from this region.
    #[serde(default = "defaults::module_heap_size")]
    pub heap_size: u32,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            stack_size: defaults::module_stack_size(),
            heap_size: defaults::module_heap_size(),
        }
    }
}

/// Orchestration settings for a benchmark run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// How many times each entry point is invoked.
    #[serde(default = "defaults::repeat")]
    pub repeat: u32,

    /// Instruction threshold passed to the instrumented entry point.
    #[serde(default = "defaults::threshold")]
    pub threshold: u64,

    /// Event identifier exposed to the guest.
    #[serde(default = "defaults::event_id")]
    pub event_id: String,

    /// Event payload exposed to the guest.
    #[serde(default = "defaults::event_payload")]
    pub event_payload: String,

    /// Header prefixed to every line the guest prints.
    #[serde(default)]
    pub print_header: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repeat: defaults::repeat(),
            threshold: defaults::threshold(),
            event_id: defaults::event_id(),
            event_payload: defaults::event_payload(),
            print_header: None,
        }
    }
}

/// Default value functions for serde.
mod defaults {
    const MIB: u32 = 1024 * 1024;

    pub const fn heap_size_bytes() -> u64 {
        70 * MIB as u64
    }

    pub const fn max_wasm_stack() -> u32 {
        MIB
    }

    pub const fn max_bytecode_size() -> u64 {
        32 * MIB as u64
    }

    pub const fn exec_stack_size() -> u32 {
        MIB
    }

    pub const fn module_stack_size() -> u32 {
        MIB
    }

    pub const fn module_heap_size() -> u32 {
        64 * MIB
    }

    pub const fn repeat() -> u32 {
        5
    }

    pub const fn threshold() -> u64 {
        u64::MAX / 2
    }

    pub fn event_id() -> String {
        "event-0".to_string()
    }

    pub fn event_payload() -> String {
        "EventMessage".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert_eq!(config.heap_size_bytes, 70 * 1024 * 1024);
        assert_eq!(config.max_wasm_stack, 1024 * 1024);
        assert_eq!(config.exec_stack_size, 1024 * 1024);
        assert_eq!(config.module.stack_size, 1024 * 1024);
        assert_eq!(config.module.heap_size, 64 * 1024 * 1024);

        let run = RunConfig::default();
        assert_eq!(run.repeat, 5);
        assert_eq!(run.threshold, u64::MAX / 2);
        assert!(run.print_header.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.heap_size_bytes, deserialized.heap_size_bytes);
        assert_eq!(config.module.heap_size, deserialized.module.heap_size);
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"module": {"heap_size": 65536}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        // Explicitly set value
        assert_eq!(config.module.heap_size, 65536);
        // Default values for unspecified fields
        assert_eq!(config.module.stack_size, 1024 * 1024);
        assert_eq!(config.heap_size_bytes, 70 * 1024 * 1024);
    }
}
