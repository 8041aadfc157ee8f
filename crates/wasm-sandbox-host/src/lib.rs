//! Host side of wasm-sandbox.
//!
//! This crate provides what the core layer leaves to the embedder: the
//! native callbacks guests import, where their output goes, where time
//! comes from, and the runner that drives a program's entry points.
//!
//! # Modules
//!
//! - [`abi`]: Import, export and global names of the sandbox ABI
//! - [`natives`]: [`SandboxNatives`], the native callback set
//! - [`logging`]: Print sinks for guest output
//! - [`clock`]: Timestamp sources for the benchmark callbacks
//! - [`instrumentation`]: Instruction counter globals
//! - [`runner`]: [`MainRunner`], [`run_benchmark`] and [`read_bytecode`]
//!
//! # Fault Model
//!
//! Native callbacks never panic. A callback that cannot complete latches a
//! `HostFailure` on the instance and unwinds the guest, so the failure
//! surfaces as a `GuestTrap` from the call that triggered it.

pub mod abi;
pub mod clock;
pub mod instrumentation;
pub mod logging;
pub mod natives;
pub mod runner;

pub use clock::{MonotonicClock, SystemClock};
pub use instrumentation::Counters;
pub use logging::{CaptureSink, HeaderSink, StdoutSink, TracingSink};
pub use natives::SandboxNatives;
pub use runner::{BenchmarkReport, MainRunner, RunOutcome, read_bytecode, run_benchmark};
