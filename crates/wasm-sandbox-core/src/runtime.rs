//! Runtime creation and teardown.
//!
//! The [`Runtime`] is the root of the ownership chain. It holds:
//! - The Wasmtime engine and a linker carrying the native callback set
//! - The heap arena every module, instance and environment charges
//! - The print sink and timestamp source native callbacks use
//!
//! Modules hold a [`SharedHandle<Runtime>`], so the runtime is torn down only
//! after the last module is gone.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument};
use wasmtime::{Config, Engine, Linker, OptLevel};

use crate::arena::HeapArena;
use crate::clock::TimestampSource;
use crate::handle::SharedHandle;
use crate::module::Module;
use crate::sink::PrintSink;
use crate::store::ExecContext;
use wasm_sandbox_common::{Resource, RuntimeConfig, RuntimeError};

/// A set of native callbacks guests can import.
pub trait NativeSet {
    /// Define every callback of the set on `linker`.
    ///
    /// # Errors
    ///
    /// Returns an error if a definition is rejected (e.g. a duplicate name).
    fn register(&self, linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError>;
}

/// No natives. Guests with imports fail to instantiate.
impl NativeSet for () {
    fn register(&self, _linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Top-level VM state.
///
/// Exists only in its initialized state: [`Runtime::create`] either returns
/// a fully set up runtime or an error, and dropping the last handle tears it
/// down. Field order is teardown order; the arena goes last.
pub struct Runtime {
    engine: Engine,
    linker: Linker<ExecContext>,
    sink: Arc<dyn PrintSink>,
    clock: Arc<dyn TimestampSource>,
    config: RuntimeConfig,
    arena: Arc<HeapArena>,
}

impl Runtime {
    /// Create a runtime with an arena of `config.heap_size_bytes`.
    ///
    /// # Errors
    ///
    /// Returns `ResourceInitialization` if:
    /// - The arena size or the stack limit is zero
    /// - The Wasmtime engine rejects the configuration
    /// - A native callback cannot be registered
    #[instrument(skip_all, fields(heap_size_bytes = config.heap_size_bytes))]
    pub fn create(
        config: &RuntimeConfig,
        sink: Arc<dyn PrintSink>,
        clock: Arc<dyn TimestampSource>,
        natives: &dyn NativeSet,
    ) -> Result<SharedHandle<Self>, RuntimeError> {
        let arena = HeapArena::new(config.heap_size_bytes)?;

        if config.max_wasm_stack == 0 {
            return Err(RuntimeError::init_failed(
                Resource::Runtime,
                "max_wasm_stack must be non-zero",
            ));
        }

        let mut wasmtime_config = Config::new();
        wasmtime_config.max_wasm_stack(config.max_wasm_stack as usize);
        wasmtime_config.cranelift_opt_level(OptLevel::Speed);

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            RuntimeError::init_failed(
                Resource::Runtime,
                format!("failed to create Wasmtime engine: {e}"),
            )
        })?;

        let mut linker = Linker::new(&engine);
        natives.register(&mut linker).map_err(|e| {
            RuntimeError::init_failed(
                Resource::Runtime,
                format!("failed to register natives: {e}"),
            )
        })?;

        info!(
            heap_size_bytes = config.heap_size_bytes,
            max_wasm_stack = config.max_wasm_stack,
            "Runtime initialized"
        );

        Ok(SharedHandle::new(Self {
            engine,
            linker,
            sink,
            clock,
            config: config.clone(),
            arena,
        }))
    }

    /// The Wasmtime engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The linker carrying the native callback set.
    pub fn linker(&self) -> &Linker<ExecContext> {
        &self.linker
    }

    /// The heap arena.
    pub fn arena(&self) -> &Arc<HeapArena> {
        &self.arena
    }

    /// The configuration the runtime was created with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The sink guest output is printed to.
    pub fn sink(&self) -> Arc<dyn PrintSink> {
        Arc::clone(&self.sink)
    }

    pub(crate) fn clock(&self) -> Arc<dyn TimestampSource> {
        Arc::clone(&self.clock)
    }
}

impl SharedHandle<Runtime> {
    /// Load and compile a module. See [`Module::load`].
    ///
    /// # Errors
    ///
    /// Returns `ResourceInitialization` if the bytecode is rejected.
    pub fn load_module(&self, bytecode: &[u8]) -> Result<SharedHandle<Module>, RuntimeError> {
        Module::load(self, bytecode)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        debug!(
            arena_peak = self.arena.peak(),
            arena_in_use = self.arena.in_use(),
            "Runtime destroyed"
        );
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("heap_size_bytes", &self.config.heap_size_bytes)
            .field("max_wasm_stack", &self.config.max_wasm_stack)
            .field("arena_in_use", &self.arena.in_use())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_runtime;

    #[test]
    fn test_runtime_creation_default() {
        let runtime = test_runtime(&RuntimeConfig::default());

        assert_eq!(runtime.arena().capacity(), 70 * 1024 * 1024);
        assert_eq!(runtime.arena().in_use(), 0);
    }

    #[test]
    fn test_runtime_zero_heap() {
        let config = RuntimeConfig {
            heap_size_bytes: 0,
            ..Default::default()
        };
        let err = Runtime::create(
            &config,
            Arc::new(crate::testing::NullSink),
            Arc::new(crate::testing::FixedClock(0)),
            &(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            RuntimeError::ResourceInitialization {
                resource: Resource::Arena,
                ..
            }
        ));
    }

    #[test]
    fn test_runtime_failing_natives() {
        struct Broken;

        impl NativeSet for Broken {
            fn register(&self, _linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError> {
                Err(RuntimeError::type_mismatch("fn()", "fn(i32)"))
            }
        }

        let err = Runtime::create(
            &RuntimeConfig::default(),
            Arc::new(crate::testing::NullSink),
            Arc::new(crate::testing::FixedClock(0)),
            &Broken,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            RuntimeError::ResourceInitialization {
                resource: Resource::Runtime,
                ..
            }
        ));
    }

    #[test]
    fn test_runtime_debug() {
        let runtime = test_runtime(&RuntimeConfig::default());

        let debug_str = format!("{runtime:?}");
        assert!(debug_str.contains("Runtime"));
        assert!(debug_str.contains("heap_size_bytes"));
    }
}
