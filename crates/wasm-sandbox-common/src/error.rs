//! Error types for wasm-sandbox.
//!
//! This module defines the error taxonomy using `thiserror`:
//! - [`RuntimeError`]: Every failure raised by the sandbox layer
//! - [`FaultKind`]: Why a guest call unwound
//! - [`TimestampError`]: Failures of the timestamp source

use std::fmt;
use std::io;

use thiserror::Error;

/// Top-level sandbox errors.
///
/// All errors are raised synchronously where they are detected and propagate
/// to the caller. Nothing in the sandbox layer retries.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Bring-up of the arena, runtime, module, instance or environment failed.
    #[error("Failed to initialize {resource}: {reason}")]
    ResourceInitialization {
        /// Which resource failed to come up.
        resource: Resource,
        /// Diagnostic text, usually forwarded from the VM.
        reason: String,
    },

    /// A named export or global does not exist.
    #[error("{kind} not found: {name}")]
    Lookup {
        /// What was looked up.
        kind: ExportKind,
        /// The exact name that was requested.
        name: String,
    },

    /// A wire value, arity or global did not match the requested host type.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// What the host side asked for.
        expected: String,
        /// What the guest side provided.
        found: String,
    },

    /// A bulk copy into a guest array had the wrong number of elements.
    #[error("Size mismatch: expected {expected} elements, got {actual}")]
    SizeMismatch {
        /// Element count of the destination.
        expected: usize,
        /// Element count of the source.
        actual: usize,
    },

    /// A guest memory block could not be allocated.
    #[error("Guest allocation of {requested} bytes failed: {reason}")]
    Allocation {
        /// Requested size in bytes (may exceed the 32-bit range).
        requested: u64,
        /// Why the allocation failed.
        reason: String,
    },

    /// The guest call unwound: a trap, an explicit exit, a threshold halt,
    /// or a failing native callback.
    #[error("Guest trap ({kind}): {message}")]
    GuestTrap {
        /// Classification of the fault.
        kind: FaultKind,
        /// The VM's latched diagnostic text.
        message: String,
    },

    /// The timestamp source failed.
    #[error("Timestamp error: {0}")]
    Timestamp(#[from] TimestampError),

    /// An element index or guest pointer fell outside its block.
    #[error("Index {index} out of bounds (length {len})")]
    OutOfBounds {
        /// The offending index or address.
        index: u64,
        /// Valid length of the block.
        len: u64,
    },

    /// Another call or memory access currently holds the instance.
    #[error("Module instance is busy")]
    InstanceBusy,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The resource whose bring-up failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// The heap arena.
    Arena,
    /// The runtime (engine, linker, natives).
    Runtime,
    /// A compiled module.
    Module,
    /// A module instance.
    Instance,
    /// An execution environment.
    ExecutionEnvironment,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Arena => write!(f, "heap arena"),
            Resource::Runtime => write!(f, "runtime"),
            Resource::Module => write!(f, "module"),
            Resource::Instance => write!(f, "module instance"),
            Resource::ExecutionEnvironment => write!(f, "execution environment"),
        }
    }
}

/// The kind of named item a lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// An exported function.
    Function,
    /// An exported global.
    Global,
    /// An exported linear memory.
    Memory,
}

impl fmt::Display for ExportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportKind::Function => write!(f, "Function"),
            ExportKind::Global => write!(f, "Global"),
            ExportKind::Memory => write!(f, "Memory"),
        }
    }
}

/// Why a guest call unwound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// A VM trap (unreachable, out-of-bounds access, stack overflow, ...).
    Trap,
    /// The guest asked to exit with the given status.
    Exit(i32),
    /// The instrumentation counter crossed its threshold.
    CounterExceeded,
    /// A native callback failed while serving the guest.
    HostFailure,
}

impl FaultKind {
    /// Returns `true` for halts the guest or instrumentation asked for.
    pub fn is_expected_halt(self) -> bool {
        matches!(self, FaultKind::Exit(_) | FaultKind::CounterExceeded)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Trap => write!(f, "trap"),
            FaultKind::Exit(code) => write!(f, "exit {code}"),
            FaultKind::CounterExceeded => write!(f, "counter exceeded"),
            FaultKind::HostFailure => write!(f, "host failure"),
        }
    }
}

/// Failures of the timestamp source.
///
/// The source may sit behind a privilege boundary, so reading it can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    /// The clock reported a time before its epoch.
    #[error("Clock is before its epoch")]
    BeforeEpoch,

    /// The underlying source was unavailable.
    #[error("Timestamp source unavailable: {reason}")]
    Unavailable {
        /// Description of the failure.
        reason: String,
    },
}

impl RuntimeError {
    /// Create a new `ResourceInitialization` error.
    pub fn init_failed(resource: Resource, reason: impl Into<String>) -> Self {
        Self::ResourceInitialization {
            resource,
            reason: reason.into(),
        }
    }

    /// Create a new `Lookup` error.
    pub fn not_found(kind: ExportKind, name: impl Into<String>) -> Self {
        Self::Lookup {
            kind,
            name: name.into(),
        }
    }

    /// Create a new `TypeMismatch` error.
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create a new `Allocation` error.
    pub fn allocation(requested: u64, reason: impl Into<String>) -> Self {
        Self::Allocation {
            requested,
            reason: reason.into(),
        }
    }

    /// Create a new `GuestTrap` error.
    pub fn guest_trap(kind: FaultKind, message: impl Into<String>) -> Self {
        Self::GuestTrap {
            kind,
            message: message.into(),
        }
    }

    /// Returns `true` if a named export or global was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Lookup { .. })
    }

    /// Returns `true` if the guest call unwound.
    pub fn is_guest_trap(&self) -> bool {
        matches!(self, Self::GuestTrap { .. })
    }

    /// Returns the fault kind if this is a guest trap.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            Self::GuestTrap { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns `true` for an explicit exit or a threshold halt.
    ///
    /// These are expected outcomes of a run, not failures.
    pub fn is_expected_halt(&self) -> bool {
        self.fault_kind().is_some_and(FaultKind::is_expected_halt)
    }
}
