//! WebAssembly instance lifecycle management.
//!
//! A [`ModuleInstance`] owns the Wasmtime store of one instantiation: its
//! linear memory, globals, app heap and exception latch. The store sits
//! behind an exclusivity lock that is never waited on: a second access while
//! a call is in flight fails with `InstanceBusy`.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use wasmtime::{Memory, Mutability, Store, Val};

use crate::arena::ArenaLease;
use crate::env::ExecutionEnvironment;
use crate::handle::SharedHandle;
use crate::heap::{GuestHeap, HeapStats};
use crate::marshal::{FromWasmValue, IntoWasmValue, ValueKind, WasmValue};
use crate::memory::{GuestType, TypedMemoryArray, TypedMemoryPointer};
use crate::module::Module;
use crate::store::{ExecContext, Exception};
use wasm_sandbox_common::{ExportKind, FaultKind, Resource, RuntimeError};

/// Size of a WebAssembly page.
pub const WASM_PAGE_SIZE: u64 = 65536;

/// Name of the memory export the app heap and guest pointers refer to.
pub const MEMORY_EXPORT: &str = "memory";

/// An instantiated module.
///
/// Holds its [`Module`], so the module outlives every instance of it. Memory
/// blocks and execution environments hold the instance in turn. Field order
/// is teardown order.
pub struct ModuleInstance {
    store: Mutex<Store<ExecContext>>,
    instance: wasmtime::Instance,
    memory: Option<Memory>,
    id: Uuid,
    _stack_lease: ArenaLease,
    module: SharedHandle<Module>,
}

impl ModuleInstance {
    /// Instantiate `module` with a stack reservation and an app heap.
    ///
    /// `heap_size` bytes (rounded up to whole pages) are appended to the
    /// exported `memory` and managed as the app heap. A `heap_size` of zero
    /// skips the heap; allocations on such an instance fail.
    ///
    /// # Errors
    ///
    /// Returns `ResourceInitialization` if:
    /// - The arena cannot hold the stack or the linear memory
    /// - An import is not provided by the runtime's natives
    /// - The start function traps
    /// - An app heap is requested but the module exports no `memory`
    #[instrument(skip(module), fields(content_hash = %module.content_hash()))]
    pub fn instantiate(
        module: &SharedHandle<Module>,
        stack_size: u32,
        heap_size: u32,
    ) -> Result<SharedHandle<Self>, RuntimeError> {
        let start = Instant::now();
        let runtime = module.runtime();

        let stack_lease = runtime
            .arena()
            .lease(u64::from(stack_size), Resource::Instance)?;

        let context = ExecContext::new(Arc::clone(runtime.arena()), runtime.sink(), runtime.clock());
        let mut store = Store::new(runtime.engine(), context);
        store.limiter(|ctx| &mut ctx.limiter);

        debug!("Instantiating module");

        let instance = runtime
            .linker()
            .instantiate(&mut store, module.inner())
            .map_err(|e| {
                RuntimeError::init_failed(Resource::Instance, format!("instantiation failed: {e:#}"))
            })?;

        let memory = instance.get_memory(&mut store, MEMORY_EXPORT);

        if heap_size > 0 {
            let memory = memory.ok_or_else(|| {
                RuntimeError::init_failed(
                    Resource::Instance,
                    "an app heap requires an exported `memory`",
                )
            })?;
            let heap = Self::append_heap(&mut store, memory, heap_size)?;
            store.data_mut().install_heap(heap);
        }

        let id = Uuid::new_v4();

        info!(
            instance_id = %id,
            stack_size,
            heap_size,
            memory_charged = store.data().memory_charged(),
            duration_us = start.elapsed().as_micros(),
            "Module instantiated"
        );

        Ok(SharedHandle::new(Self {
            store: Mutex::new(store),
            instance,
            memory,
            id,
            _stack_lease: stack_lease,
            module: module.clone(),
        }))
    }

    /// Grow `memory` by enough pages for `heap_size` bytes and manage them.
    fn append_heap(
        store: &mut Store<ExecContext>,
        memory: Memory,
        heap_size: u32,
    ) -> Result<GuestHeap, RuntimeError> {
        let pages = u64::from(heap_size).div_ceil(WASM_PAGE_SIZE);

        let previous = memory.grow(&mut *store, pages).map_err(|e| {
            RuntimeError::init_failed(
                Resource::Instance,
                format!("failed to grow memory by {pages} pages for the app heap: {e:#}"),
            )
        })?;

        let base = previous
            .checked_mul(WASM_PAGE_SIZE)
            .and_then(|base| u32::try_from(base).ok())
            .ok_or_else(|| {
                RuntimeError::init_failed(
                    Resource::Instance,
                    "app heap lies beyond the 32-bit guest range",
                )
            })?;
        let len = u32::try_from(pages * WASM_PAGE_SIZE).unwrap_or(u32::MAX);

        debug!(base, len, "App heap appended");

        Ok(GuestHeap::new(base, len))
    }

    /// Unique id of this instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The module this instance was created from.
    pub fn module(&self) -> &SharedHandle<Module> {
        &self.module
    }

    /// The Wasmtime instance.
    pub fn inner(&self) -> &wasmtime::Instance {
        &self.instance
    }

    /// Take the store without waiting.
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if it is already held.
    pub(crate) fn lock_store(&self) -> Result<MutexGuard<'_, Store<ExecContext>>, RuntimeError> {
        self.store.try_lock().ok_or(RuntimeError::InstanceBusy)
    }

    /// Read an exported global.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `Lookup` if no global is exported under `name`
    /// - `TypeMismatch` if its declared type is not exactly `T`'s
    pub fn get_global<T: FromWasmValue>(&self, name: &str) -> Result<T, RuntimeError> {
        let mut store = self.lock_store()?;
        let global = self
            .instance
            .get_global(&mut *store, name)
            .ok_or_else(|| RuntimeError::not_found(ExportKind::Global, name))?;

        let ty = global.ty(&*store);
        check_kind(T::KIND, ValueKind::of(ty.content()))?;

        let value = WasmValue::try_from(&global.get(&mut *store))?;
        T::from_wasm_value(value)
    }

    /// Write an exported global.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `Lookup` if no global is exported under `name`
    /// - `TypeMismatch` if its declared type is not exactly `T`'s, or it is
    ///   immutable
    pub fn set_global<T: IntoWasmValue + FromWasmValue>(
        &self,
        name: &str,
        value: T,
    ) -> Result<(), RuntimeError> {
        let mut store = self.lock_store()?;
        let global = self
            .instance
            .get_global(&mut *store, name)
            .ok_or_else(|| RuntimeError::not_found(ExportKind::Global, name))?;

        let ty = global.ty(&*store);
        check_kind(T::KIND, ValueKind::of(ty.content()))?;
        if ty.mutability() == Mutability::Const {
            return Err(RuntimeError::type_mismatch(
                "mutable global",
                format!("immutable global `{name}`"),
            ));
        }

        global
            .set(&mut *store, Val::from(value.into_wasm_value()))
            .map_err(|e| RuntimeError::type_mismatch(T::KIND.to_string(), e.to_string()))
    }

    /// The latched exception, if any.
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if a call is in flight.
    pub fn exception(&self) -> Result<Option<Exception>, RuntimeError> {
        Ok(self.lock_store()?.data().exception().cloned())
    }

    /// Returns `true` if an exception is latched.
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if a call is in flight.
    pub fn has_exception(&self) -> Result<bool, RuntimeError> {
        Ok(self.lock_store()?.data().exception().is_some())
    }

    /// Message of the latched exception, if any.
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if a call is in flight.
    pub fn exception_message(&self) -> Result<Option<String>, RuntimeError> {
        Ok(self
            .lock_store()?
            .data()
            .exception()
            .map(|exception| exception.message.clone()))
    }

    /// Clear the latch so the instance accepts calls again.
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if a call is in flight.
    pub fn clear_exception(&self) -> Result<Option<Exception>, RuntimeError> {
        Ok(self.lock_store()?.data_mut().clear_exception())
    }

    /// Latch an exception from host code.
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if a call is in flight.
    pub fn set_exception(&self, kind: FaultKind, message: impl Into<String>) -> Result<(), RuntimeError> {
        self.lock_store()?.data_mut().set_exception(kind, message);
        Ok(())
    }

    /// App heap statistics, or `None` if the instance has no app heap.
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if a call is in flight.
    pub fn heap_stats(&self) -> Result<Option<HeapStats>, RuntimeError> {
        Ok(self.lock_store()?.data().heap().map(GuestHeap::stats))
    }

    /// Current size of the exported memory in bytes (0 without one).
    ///
    /// # Errors
    ///
    /// Returns `InstanceBusy` if a call is in flight.
    pub fn memory_size(&self) -> Result<u64, RuntimeError> {
        let store = self.lock_store()?;
        Ok(self
            .memory
            .map_or(0, |memory| memory.data_size(&*store) as u64))
    }

    pub(crate) fn alloc_block(&self, bytes: u64) -> Result<u32, RuntimeError> {
        let size = u32::try_from(bytes).map_err(|_| {
            RuntimeError::allocation(bytes, "request exceeds the 32-bit guest range")
        })?;

        let mut store = self.lock_store()?;
        let heap = store
            .data_mut()
            .heap_mut()
            .ok_or_else(|| RuntimeError::allocation(bytes, "instance has no app heap"))?;

        heap.alloc(size)
            .ok_or_else(|| RuntimeError::allocation(bytes, "app heap exhausted"))
    }

    pub(crate) fn free_block(&self, address: u32) {
        let Ok(mut store) = self.lock_store() else {
            warn!(address, "Instance busy, guest block leaked");
            return;
        };

        match store.data_mut().heap_mut().and_then(|heap| heap.free(address)) {
            Some(size) => debug!(address, size, "Guest block freed"),
            None => warn!(address, "Free of unknown guest block"),
        }
    }

    /// Run `f` over `len` bytes of guest memory at `address`.
    pub(crate) fn with_guest_bytes<R>(
        &self,
        address: u32,
        len: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, RuntimeError> {
        let memory = self
            .memory
            .ok_or_else(|| RuntimeError::not_found(ExportKind::Memory, MEMORY_EXPORT))?;

        let mut store = self.lock_store()?;
        let data = memory.data_mut(&mut *store);
        let available = data.len() as u64;

        let start = address as usize;
        let end = start + len as usize;
        let bytes = data.get_mut(start..end).ok_or(RuntimeError::OutOfBounds {
            index: u64::from(address) + u64::from(len),
            len: available,
        })?;

        Ok(f(bytes))
    }
}

fn check_kind(expected: ValueKind, declared: Option<ValueKind>) -> Result<(), RuntimeError> {
    match declared {
        Some(kind) if kind == expected => Ok(()),
        Some(kind) => Err(RuntimeError::type_mismatch(expected.to_string(), kind.to_string())),
        None => Err(RuntimeError::type_mismatch(expected.to_string(), "non-numeric global")),
    }
}

impl SharedHandle<ModuleInstance> {
    /// Create an execution environment bound to this instance.
    ///
    /// # Errors
    ///
    /// Returns `ResourceInitialization` if the stack size is zero, above the
    /// runtime's stack limit, or does not fit the arena.
    pub fn create_execution_environment(
        &self,
        stack_size: u32,
    ) -> Result<ExecutionEnvironment, RuntimeError> {
        ExecutionEnvironment::create(self, stack_size)
    }

    /// Allocate a `T` in the app heap, initialized to `value`.
    ///
    /// # Errors
    ///
    /// Returns `Allocation` if the instance has no app heap or it is full.
    pub fn allocate<T: GuestType>(&self, value: T) -> Result<TypedMemoryPointer<T>, RuntimeError> {
        TypedMemoryPointer::allocate(self, &value)
    }

    /// Allocate `len` zeroed `T`s in the app heap.
    ///
    /// # Errors
    ///
    /// Returns `Allocation` if the total size exceeds the 32-bit range, the
    /// instance has no app heap, or it is full.
    pub fn allocate_array<T: GuestType>(
        &self,
        len: usize,
    ) -> Result<TypedMemoryArray<T>, RuntimeError> {
        TypedMemoryArray::allocate(self, len)
    }
}

impl Drop for ModuleInstance {
    fn drop(&mut self) {
        debug!(instance_id = %self.id, "Module instance destroyed");
    }
}

impl fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("id", &self.id)
            .field("content_hash", &self.module.content_hash())
            .field("has_memory", &self.memory.is_some())
            .finish_non_exhaustive()
    }
}
