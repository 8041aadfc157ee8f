//! Guest-facing names of the sandbox ABI.
//!
//! Guests import the natives from [`NATIVE_NAMESPACE`] and export one or
//! both entry points. Instrumented builds also export the two counter
//! globals, both `u64`.

/// ABI revision described by this module.
pub const ABI_VERSION: u32 = 1;

/// Import namespace of the native callback set.
pub const NATIVE_NAMESPACE: &str = "env";

/// Import namespace of the WASI subset (`proc_exit` only).
pub const WASI_NAMESPACE: &str = "wasi_snapshot_preview1";

/// `(a: i32, b: i32) -> i32`, wrapping add.
pub const SUM: &str = "sandbox_sum";
/// `(ptr: i32)`, prints a NUL-terminated string.
pub const PRINT: &str = "sandbox_print";
/// Alias of [`PRINT`].
pub const PRINT_STRING: &str = "sandbox_print_string";
/// `()`, records the benchmark start time.
pub const START_BENCHMARK: &str = "sandbox_start_benchmark";
/// `()`, prints the elapsed time since the start.
pub const STOP_BENCHMARK: &str = "sandbox_stop_benchmark";
/// `() -> i32`, event id length in bytes.
pub const GET_EVENT_ID_LEN: &str = "sandbox_get_event_id_len";
/// `() -> i32`, event payload length in bytes.
pub const GET_EVENT_PAYLOAD_LEN: &str = "sandbox_get_event_payload_len";
/// `(ptr: i32, len: i32) -> i32`, copies the event id, returns its full size.
pub const GET_EVENT_ID: &str = "sandbox_get_event_id";
/// `(ptr: i32, len: i32) -> i32`, copies the event payload, returns its full size.
pub const GET_EVENT_PAYLOAD: &str = "sandbox_get_event_payload";
/// `(code: i32)`, ends the run.
pub const EXIT: &str = "sandbox_exit";
/// `()`, called by instrumented code once the counter passes the threshold.
pub const COUNTER_EXCEEDED: &str = "sandbox_counter_exceeded";
/// `(code: i32)` under [`WASI_NAMESPACE`], same as [`EXIT`].
pub const PROC_EXIT: &str = "proc_exit";

/// `(event_id_len: u32, event_payload_len: u32) -> i32`
pub const MAIN: &str = "sandbox_main";
/// `(event_id_len: u32, event_payload_len: u32, threshold: u64) -> i32`
pub const INSTRUMENTED_MAIN: &str = "sandbox_instrumented_main";

/// Instruction counter maintained by instrumented code.
pub const COUNTER_GLOBAL: &str = "sandbox_counter";
/// Threshold the counter is compared against.
pub const THRESHOLD_GLOBAL: &str = "sandbox_threshold";
