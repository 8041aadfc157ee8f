//! WebAssembly module loading.
//!
//! This module provides [`Module`], a compiled unit that owns a copy of its
//! bytecode and keeps its [`Runtime`] alive.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{info, instrument};

use crate::arena::ArenaLease;
use crate::handle::SharedHandle;
use crate::instance::ModuleInstance;
use crate::runtime::Runtime;
use wasm_sandbox_common::{Resource, RuntimeError};

/// A compiled WebAssembly module.
///
/// The bytecode is copied on load: the caller's buffer may be released
/// immediately. The copy is charged to the runtime's arena for as long as
/// the module lives. Field order is teardown order.
pub struct Module {
    /// The compiled Wasmtime module.
    inner: wasmtime::Module,

    /// Owned copy of the bytecode.
    bytecode: Box<[u8]>,

    /// Hash of the bytecode.
    content_hash: String,

    _bytecode_lease: ArenaLease,

    runtime: SharedHandle<Runtime>,
}

impl Module {
    /// Load a module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns `ResourceInitialization` if:
    /// - The bytecode exceeds `max_bytecode_size` or has a bad header
    /// - The arena cannot hold the bytecode copy
    /// - Compilation fails (the diagnostic is carried in the error)
    #[instrument(skip(runtime, bytecode), fields(bytes_len = bytecode.len()))]
    pub fn load(
        runtime: &SharedHandle<Runtime>,
        bytecode: &[u8],
    ) -> Result<SharedHandle<Self>, RuntimeError> {
        Self::check_size(runtime, bytecode)?;
        Self::validate_wasm_header(bytecode)?;
        Self::compile(runtime, bytecode)
    }

    /// Load a module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes. The text itself is kept as
    /// the module's bytecode.
    ///
    /// # Errors
    ///
    /// Returns `ResourceInitialization` if the text exceeds
    /// `max_bytecode_size` or does not compile.
    #[instrument(skip(runtime, wat))]
    pub fn from_wat(
        runtime: &SharedHandle<Runtime>,
        wat: &str,
    ) -> Result<SharedHandle<Self>, RuntimeError> {
        Self::check_size(runtime, wat.as_bytes())?;
        Self::compile(runtime, wat.as_bytes())
    }

    fn check_size(runtime: &SharedHandle<Runtime>, source: &[u8]) -> Result<(), RuntimeError> {
        let max = runtime.config().max_bytecode_size;
        if source.len() as u64 > max {
            return Err(RuntimeError::init_failed(
                Resource::Module,
                format!("bytecode is {} bytes, limit is {max}", source.len()),
            ));
        }
        Ok(())
    }

    fn compile(
        runtime: &SharedHandle<Runtime>,
        source: &[u8],
    ) -> Result<SharedHandle<Self>, RuntimeError> {
        let start = Instant::now();

        let lease = runtime.arena().lease(source.len() as u64, Resource::Module)?;
        let bytecode: Box<[u8]> = source.into();

        let inner = wasmtime::Module::new(runtime.engine(), &bytecode).map_err(|e| {
            RuntimeError::init_failed(Resource::Module, format!("compilation failed: {e:#}"))
        })?;

        let content_hash = compute_hash(&bytecode);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Module loaded"
        );

        Ok(SharedHandle::new(Self {
            inner,
            bytecode,
            content_hash,
            _bytecode_lease: lease,
            runtime: runtime.clone(),
        }))
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::init_failed(
                Resource::Module,
                "invalid Wasm: file too small",
            ));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::init_failed(
                Resource::Module,
                "invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }

    /// The owned bytecode copy.
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    /// Hash of the bytecode.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// The runtime this module was loaded into.
    pub fn runtime(&self) -> &SharedHandle<Runtime> {
        &self.runtime
    }

    /// Names of everything the module exports.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.inner.exports().map(|export| export.name())
    }

    /// The compiled Wasmtime module.
    pub fn inner(&self) -> &wasmtime::Module {
        &self.inner
    }
}

impl SharedHandle<Module> {
    /// Instantiate the module. See [`ModuleInstance::instantiate`].
    ///
    /// # Errors
    ///
    /// Returns `ResourceInitialization` if instantiation fails.
    pub fn instantiate(
        &self,
        stack_size: u32,
        heap_size: u32,
    ) -> Result<SharedHandle<ModuleInstance>, RuntimeError> {
        ModuleInstance::instantiate(self, stack_size, heap_size)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("content_hash", &self.content_hash)
            .field("bytecode_len", &self.bytecode.len())
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_runtime;
    use wasm_sandbox_common::RuntimeConfig;

    // Minimal valid Wasm module (empty module)
    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    #[test]
    fn test_validate_wasm_header_valid() {
        assert!(Module::validate_wasm_header(MINIMAL_WASM).is_ok());
    }

    #[test]
    fn test_validate_wasm_header_too_small() {
        let result = Module::validate_wasm_header(&[0x00, 0x61]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_wasm_header_bad_magic() {
        let bad_wasm = &[0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let result = Module::validate_wasm_header(bad_wasm);
        assert!(result.is_err());
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16); // 64-bit hex
    }

    #[test]
    fn test_module_load_copies_bytecode() {
        let runtime = test_runtime(&RuntimeConfig::default());

        let mut buffer = MINIMAL_WASM.to_vec();
        let module = runtime.load_module(&buffer).unwrap();
        buffer.clear();

        assert_eq!(module.bytecode(), MINIMAL_WASM);
        assert!(!module.content_hash().is_empty());
        assert_eq!(runtime.arena().in_use(), MINIMAL_WASM.len() as u64);

        drop(module);
        assert_eq!(runtime.arena().in_use(), 0);
    }

    #[test]
    fn test_module_keeps_runtime_alive() {
        let runtime = test_runtime(&RuntimeConfig::default());
        let module = runtime.load_module(MINIMAL_WASM).unwrap();

        assert_eq!(SharedHandle::strong_count(&runtime), 2);
        drop(runtime);
        assert_eq!(module.runtime().arena().in_use(), MINIMAL_WASM.len() as u64);
    }

    #[test]
    fn test_module_too_large() {
        let config = RuntimeConfig {
            max_bytecode_size: 4,
            ..Default::default()
        };
        let runtime = test_runtime(&config);

        let err = runtime.load_module(MINIMAL_WASM).unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ResourceInitialization {
                resource: Resource::Module,
                ..
            }
        ));
    }

    #[test]
    fn test_wat_module_too_large() {
        let config = RuntimeConfig {
            max_bytecode_size: 16,
            ..Default::default()
        };
        let runtime = test_runtime(&config);

        let err = Module::from_wat(&runtime, "(module (memory 1))").unwrap_err();
        assert!(err.to_string().contains("limit is 16"));
        assert_eq!(runtime.arena().in_use(), 0);
    }

    #[test]
    fn test_module_compile_error_carries_diagnostic() {
        let runtime = test_runtime(&RuntimeConfig::default());

        // Valid header, truncated section
        let bytes = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0x01, 0x05];
        let err = runtime.load_module(&bytes).unwrap_err();

        assert!(err.to_string().contains("compilation failed"));
        assert_eq!(runtime.arena().in_use(), 0);
    }

    #[test]
    fn test_module_exports() {
        let runtime = test_runtime(&RuntimeConfig::default());
        let module = Module::from_wat(
            &runtime,
            r#"(module
                (memory (export "memory") 1)
                (func (export "noop")))"#,
        )
        .unwrap();

        let exports: Vec<&str> = module.exports().collect();
        assert_eq!(exports, vec!["memory", "noop"]);
    }

    #[test]
    fn test_module_debug() {
        let runtime = test_runtime(&RuntimeConfig::default());
        let module = runtime.load_module(MINIMAL_WASM).unwrap();

        let debug_str = format!("{module:?}");
        assert!(debug_str.contains("Module"));
        assert!(debug_str.contains("content_hash"));
    }
}
