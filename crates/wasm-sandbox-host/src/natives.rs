//! Native callback registration for Wasmtime linkers.
//!
//! [`SandboxNatives`] defines the sandbox ABI (see [`crate::abi`]) on a
//! runtime's linker. Every callback that cannot do its job latches a
//! `HostFailure` on the instance and unwinds the guest; `exit` and the
//! counter callback latch `Exit` and `CounterExceeded` instead.

use tracing::{debug, warn};
use wasmtime::{Caller, Extern, Linker, Memory, Val};

use crate::abi;
use wasm_sandbox_common::{FaultKind, Resource, RuntimeError};
use wasm_sandbox_core::{ExecContext, MEMORY_EXPORT, NativeSet, UserData};

/// The native callback set guests of the sandbox ABI import.
#[derive(Debug, Default, Clone, Copy)]
pub struct SandboxNatives;

impl NativeSet for SandboxNatives {
    fn register(&self, linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError> {
        register_all(linker)
    }
}

/// Register every native of the sandbox ABI.
///
/// # Errors
///
/// Returns an error if a definition is rejected.
pub fn register_all(linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError> {
    register_sum(linker)?;
    register_print(linker)?;
    register_benchmark(linker)?;
    register_events(linker)?;
    register_exit(linker)?;
    register_counter_exceeded(linker)?;
    Ok(())
}

fn define_error(name: &str, e: &wasmtime::Error) -> RuntimeError {
    RuntimeError::init_failed(Resource::Runtime, format!("cannot define native `{name}`: {e}"))
}

/// Register `sandbox_sum(a: i32, b: i32) -> i32`.
pub fn register_sum(linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(abi::NATIVE_NAMESPACE, abi::SUM, |a: i32, b: i32| {
            a.wrapping_add(b)
        })
        .map_err(|e| define_error(abi::SUM, &e))?;
    Ok(())
}

/// Register `sandbox_print(ptr: i32)` and its `sandbox_print_string` alias.
///
/// # Memory Protocol
///
/// `ptr` points at a NUL-terminated byte string in the guest's exported
/// `memory`. The bytes before the NUL go to the print sink unchanged.
pub fn register_print(linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError> {
    for name in [abi::PRINT, abi::PRINT_STRING] {
        linker
            .func_wrap(
                abi::NATIVE_NAMESPACE,
                name,
                |mut caller: Caller<'_, ExecContext>, ptr: i32| -> wasmtime::Result<()> {
                    let text = read_c_string(&mut caller, ptr)?;
                    caller.data().print(&text);
                    Ok(())
                },
            )
            .map_err(|e| define_error(name, &e))?;
    }
    Ok(())
}

/// Register `sandbox_start_benchmark()` and `sandbox_stop_benchmark()`.
///
/// Start prints a notice and records the timestamp source's reading in the
/// active `UserData`; stop prints start, end and elapsed microseconds.
pub fn register_benchmark(linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            abi::NATIVE_NAMESPACE,
            abi::START_BENCHMARK,
            |mut caller: Caller<'_, ExecContext>| -> wasmtime::Result<()> {
                caller.data().print(b"Benchmark started.\n");
                let now = now_us(&mut caller)?;
                user_data_mut(&mut caller)?.set_start_time_us(now);
                Ok(())
            },
        )
        .map_err(|e| define_error(abi::START_BENCHMARK, &e))?;

    linker
        .func_wrap(
            abi::NATIVE_NAMESPACE,
            abi::STOP_BENCHMARK,
            |mut caller: Caller<'_, ExecContext>| -> wasmtime::Result<()> {
                let end = now_us(&mut caller)?;
                let start = user_data_mut(&mut caller)?.start_time_us();
                let message = format!(
                    "Benchmark stopped. (Started @ {start} us, ended @ {end} us, spent {} us)\n",
                    end.saturating_sub(start)
                );
                caller.data().print(message.as_bytes());
                Ok(())
            },
        )
        .map_err(|e| define_error(abi::STOP_BENCHMARK, &e))?;

    Ok(())
}

/// Register the four event accessors.
///
/// # Memory Protocol
///
/// The getters copy `min(len, size)` bytes to `ptr` and return the full
/// size, so a guest can size its buffer with a first call.
pub fn register_events(linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError> {
    define_event_len(linker, abi::GET_EVENT_ID_LEN, UserData::event_id)?;
    define_event_len(linker, abi::GET_EVENT_PAYLOAD_LEN, UserData::event_payload)?;
    define_event_copy(linker, abi::GET_EVENT_ID, UserData::event_id)?;
    define_event_copy(linker, abi::GET_EVENT_PAYLOAD, UserData::event_payload)?;
    Ok(())
}

fn define_event_len(
    linker: &mut Linker<ExecContext>,
    name: &'static str,
    select: fn(&UserData) -> &[u8],
) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            abi::NATIVE_NAMESPACE,
            name,
            move |mut caller: Caller<'_, ExecContext>| -> wasmtime::Result<i32> {
                let len = select(user_data_mut(&mut caller)?).len();
                Ok(guest_i32(len))
            },
        )
        .map_err(|e| define_error(name, &e))?;
    Ok(())
}

fn define_event_copy(
    linker: &mut Linker<ExecContext>,
    name: &'static str,
    select: fn(&UserData) -> &[u8],
) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            abi::NATIVE_NAMESPACE,
            name,
            move |mut caller: Caller<'_, ExecContext>,
                  ptr: i32,
                  len: i32|
                  -> wasmtime::Result<i32> {
                let memory = guest_memory(&mut caller)?;
                let (data, ctx) = memory.data_and_store_mut(&mut caller);

                let copied = match ctx.user_data() {
                    Some(user_data) => {
                        let source = select(user_data);
                        let count = (guest_offset(len)).min(source.len());
                        let start = guest_offset(ptr);
                        match data.get_mut(start..start + count) {
                            Some(target) => {
                                target.copy_from_slice(&source[..count]);
                                Ok(source.len())
                            }
                            None => Err(format!(
                                "{name}: {count} bytes at guest address {start} are out of bounds"
                            )),
                        }
                    }
                    None => Err(format!("{name}: no execution environment is active")),
                };

                match copied {
                    Ok(size) => Ok(guest_i32(size)),
                    Err(message) => Err(ctx.raise(FaultKind::HostFailure, message)),
                }
            },
        )
        .map_err(|e| define_error(name, &e))?;
    Ok(())
}

/// Register `sandbox_exit(code: i32)` and WASI `proc_exit(code: i32)`.
///
/// Both latch `Exit(code)` and unwind. The orchestration layer treats that
/// as a normal end of the run.
pub fn register_exit(linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError> {
    for (module, name) in [
        (abi::NATIVE_NAMESPACE, abi::EXIT),
        (abi::WASI_NAMESPACE, abi::PROC_EXIT),
    ] {
        linker
            .func_wrap(
                module,
                name,
                |mut caller: Caller<'_, ExecContext>, code: i32| -> wasmtime::Result<()> {
                    debug!(code, "Guest requested exit");
                    Err(caller
                        .data_mut()
                        .raise(FaultKind::Exit(code), format!("guest exit with code {code}")))
                },
            )
            .map_err(|e| define_error(name, &e))?;
    }
    Ok(())
}

/// Register `sandbox_counter_exceeded()`.
///
/// Reads the counter and threshold globals, prints them, records the count
/// in the active `UserData`, latches `CounterExceeded` and unwinds.
pub fn register_counter_exceeded(linker: &mut Linker<ExecContext>) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            abi::NATIVE_NAMESPACE,
            abi::COUNTER_EXCEEDED,
            |mut caller: Caller<'_, ExecContext>| -> wasmtime::Result<()> {
                let threshold = read_u64_global(&mut caller, abi::THRESHOLD_GLOBAL)?;
                let counter = read_u64_global(&mut caller, abi::COUNTER_GLOBAL)?;

                let message =
                    format!("Counter exceeded. (Threshold: {threshold}, Counter: {counter})\n");
                caller.data().print(message.as_bytes());

                user_data_mut(&mut caller)?.record_threshold_exceeded(counter);

                warn!(threshold, counter, "Instruction threshold exceeded");
                Err(caller.data_mut().raise(
                    FaultKind::CounterExceeded,
                    format!("counter {counter} exceeded threshold {threshold}"),
                ))
            },
        )
        .map_err(|e| define_error(abi::COUNTER_EXCEEDED, &e))?;
    Ok(())
}

/// Latch a host failure and produce the error to unwind with.
fn host_failure(caller: &mut Caller<'_, ExecContext>, message: String) -> wasmtime::Error {
    warn!(%message, "Native callback failed");
    caller.data_mut().raise(FaultKind::HostFailure, message)
}

fn guest_memory(caller: &mut Caller<'_, ExecContext>) -> wasmtime::Result<Memory> {
    match caller.get_export(MEMORY_EXPORT).and_then(Extern::into_memory) {
        Some(memory) => Ok(memory),
        None => Err(host_failure(caller, "guest exports no `memory`".to_string())),
    }
}

fn user_data_mut<'a>(caller: &'a mut Caller<'_, ExecContext>) -> wasmtime::Result<&'a mut UserData> {
    if caller.data().user_data().is_none() {
        return Err(host_failure(
            caller,
            "no execution environment is active".to_string(),
        ));
    }
    caller
        .data_mut()
        .user_data_mut()
        .ok_or_else(|| wasmtime::Error::msg("no execution environment is active"))
}

fn now_us(caller: &mut Caller<'_, ExecContext>) -> wasmtime::Result<u64> {
    match caller.data().now_us() {
        Ok(now) => Ok(now),
        Err(e) => Err(host_failure(caller, format!("timestamp source failed: {e}"))),
    }
}

fn read_c_string(caller: &mut Caller<'_, ExecContext>, ptr: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let start = guest_offset(ptr);

    let text = memory.data(&*caller).get(start..).and_then(|tail| {
        tail.iter()
            .position(|&b| b == 0)
            .map(|end| tail[..end].to_vec())
    });

    match text {
        Some(text) => Ok(text),
        None => Err(host_failure(
            caller,
            format!("no NUL-terminated string at guest address {start}"),
        )),
    }
}

fn read_u64_global(caller: &mut Caller<'_, ExecContext>, name: &str) -> wasmtime::Result<u64> {
    let value = caller
        .get_export(name)
        .and_then(Extern::into_global)
        .map(|global| global.get(&mut *caller));

    match value {
        #[allow(clippy::cast_sign_loss)]
        Some(Val::I64(v)) => Ok(v as u64),
        Some(_) => Err(host_failure(caller, format!("global `{name}` is not a u64"))),
        None => Err(host_failure(caller, format!("guest exports no global `{name}`"))),
    }
}

/// Guest pointers and lengths are unsigned 32-bit values.
#[allow(clippy::cast_sign_loss)]
fn guest_offset(value: i32) -> usize {
    value as u32 as usize
}

/// Sizes are checked against `u32::MAX` on the way in; the guest reads the
/// bit pattern as unsigned.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn guest_i32(size: usize) -> i32 {
    size as u32 as i32
}
