//! Core ownership and marshalling layer for wasm-sandbox.
//!
//! This crate wraps a Wasmtime engine in a chain of owning handles:
//! - [`Runtime`]: Engine, linker with the native callback set, heap arena
//! - [`Module`]: Compiled bytecode, owns a copy of the bytes
//! - [`ModuleInstance`]: Linear memory, globals, app heap, exception latch
//! - [`ExecutionEnvironment`]: Stack reservation and [`UserData`] for calls
//!
//! plus typed guest memory ([`TypedMemoryPointer`], [`TypedMemoryArray`]),
//! the value marshaller ([`WasmValue`], [`CallArgs`], [`CallResults`]) and
//! the [`CallInvoker`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Runtime                          │
//! │  - Engine + Linker<ExecContext> (natives)               │
//! │  - HeapArena (every allocation below is charged here)   │
//! └─────────────────────────────────────────────────────────┘
//!                            ▲ SharedHandle
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Module                           │
//! │  - Compiled code, bytecode copy                         │
//! └─────────────────────────────────────────────────────────┘
//!                            ▲ SharedHandle
//! ┌─────────────────────────────────────────────────────────┐
//! │           ModuleInstance (Store<ExecContext>)           │
//! │  - Linear memory + app heap, globals, exception latch   │
//! └─────────────────────────────────────────────────────────┘
//!               ▲ SharedHandle            ▲ SharedHandle
//! ┌──────────────────────────┐ ┌────────────────────────────┐
//! │   ExecutionEnvironment   │ │ TypedMemoryPointer / Array │
//! │  - Stack, UserData       │ │  - One guest heap block    │
//! └──────────────────────────┘ └────────────────────────────┘
//! ```
//!
//! Arrows point at the owner. An owner is dropped only after everything
//! pointing at it, so teardown always runs in dependency order.

pub mod arena;
pub mod clock;
pub mod env;
pub mod handle;
pub mod heap;
pub mod instance;
pub mod invoke;
pub mod marshal;
pub mod memory;
pub mod module;
pub mod runtime;
pub mod sink;
pub mod store;
pub mod user_data;

pub use arena::{ArenaLease, ArenaLimiter, ArenaRelease, HeapArena};
pub use clock::TimestampSource;
pub use env::ExecutionEnvironment;
pub use handle::{Deleter, ForeignHandle, RawHandle, SharedHandle};
pub use heap::{GuestHeap, HeapStats};
pub use instance::{MEMORY_EXPORT, ModuleInstance, WASM_PAGE_SIZE};
pub use invoke::{CallInvoker, CallPhase};
pub use marshal::{CallArgs, CallResults, FromWasmValue, IntoWasmValue, ValueKind, WasmValue};
pub use memory::{GuestFree, GuestType, TypedMemoryArray, TypedMemoryPointer};
pub use module::Module;
pub use runtime::{NativeSet, Runtime};
pub use sink::PrintSink;
pub use store::{ExecContext, Exception};
pub use user_data::UserData;
