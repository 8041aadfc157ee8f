//! Export lookup and invocation.
//!
//! A call moves through [`CallPhase`]s:
//!
//! ```text
//! Idle → Encoding → Invoking → Decoding → Idle
//!                      │
//!                      └─→ Faulted
//! ```
//!
//! Lookup and signature checks happen before anything touches guest state.

use std::time::Instant;

use tracing::{debug, instrument, trace, warn};
use wasmtime::{FuncType, Val};

use crate::env::ExecutionEnvironment;
use crate::marshal::{CallArgs, CallResults, ValueKind, WasmValue};
use wasm_sandbox_common::{ExportKind, RuntimeError};

/// Where a call currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// No call in progress.
    Idle,
    /// Host arguments are being encoded.
    Encoding,
    /// The guest is running.
    Invoking,
    /// Guest results are being decoded.
    Decoding,
    /// The guest unwound. The fault is latched on the instance.
    Faulted,
}

impl CallPhase {
    fn can_advance_to(self, next: CallPhase) -> bool {
        matches!(
            (self, next),
            (CallPhase::Idle, CallPhase::Encoding)
                | (CallPhase::Encoding, CallPhase::Invoking | CallPhase::Idle)
                | (CallPhase::Invoking, CallPhase::Decoding | CallPhase::Faulted)
                | (CallPhase::Decoding | CallPhase::Faulted, CallPhase::Idle)
        )
    }
}

/// Calls exported functions of an environment's instance.
pub struct CallInvoker<'env> {
    env: &'env mut ExecutionEnvironment,
    phase: CallPhase,
}

impl<'env> CallInvoker<'env> {
    /// An idle invoker for `env`.
    pub fn new(env: &'env mut ExecutionEnvironment) -> Self {
        Self {
            env,
            phase: CallPhase::Idle,
        }
    }

    /// The current phase.
    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    fn advance(&mut self, next: CallPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal call phase transition {:?} -> {next:?}",
            self.phase
        );
        trace!(from = ?self.phase, to = ?next, "Call phase");
        self.phase = next;
    }

    /// Call the export `name` with `args`, decoding its results as `R`.
    ///
    /// The environment's `UserData` is lent to native callbacks for the
    /// duration of the call and returned afterwards, also on failure.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `GuestTrap` if the export exists but an exception is already latched
    ///   (nothing runs), or
    ///   the guest unwinds (the fault is latched)
    /// - `Lookup` if no function is exported under `name`
    /// - `TypeMismatch` if the argument or result signature does not match
    /// - `InstanceBusy` if another call holds the instance
    #[instrument(skip(self, args), fields(function = %name, environment_id = %self.env.id()))]
    pub fn call<R: CallResults, A: CallArgs>(
        &mut self,
        name: &str,
        args: A,
    ) -> Result<R, RuntimeError> {
        if self.phase == CallPhase::Faulted {
            self.advance(CallPhase::Idle);
        }

        let instance = self.env.instance().clone();
        let mut store = instance.lock_store()?;

        let func = instance
            .inner()
            .get_func(&mut *store, name)
            .ok_or_else(|| RuntimeError::not_found(ExportKind::Function, name))?;

        if let Some(exception) = store.data().exception() {
            warn!(kind = %exception.kind, "Call refused: exception pending");
            return Err(RuntimeError::guest_trap(
                exception.kind,
                format!("pending exception: {}", exception.message),
            ));
        }

        self.advance(CallPhase::Encoding);
        let params = match encode::<R, A>(&func.ty(&*store), args) {
            Ok(params) => params,
            Err(e) => {
                self.advance(CallPhase::Idle);
                return Err(e);
            }
        };
        let mut results = vec![Val::I32(0); R::ARITY];

        self.advance(CallPhase::Invoking);
        let start = Instant::now();
        store.data_mut().lend(self.env.id(), self.env.take_user_data());
        let outcome = func.call(&mut *store, &params, &mut results);
        if let Some(user_data) = store.data_mut().reclaim() {
            self.env.restore_user_data(user_data);
        }

        if let Err(error) = outcome {
            self.advance(CallPhase::Faulted);
            let exception = store.data_mut().latch_failure(&error);
            warn!(
                kind = %exception.kind,
                message = %exception.message,
                duration_us = start.elapsed().as_micros(),
                "Guest call faulted"
            );
            return Err(RuntimeError::guest_trap(exception.kind, exception.message));
        }

        self.advance(CallPhase::Decoding);
        let decoded = results
            .iter()
            .map(WasmValue::try_from)
            .collect::<Result<Vec<_>, _>>()
            .and_then(|values| R::decode(&values));
        self.advance(CallPhase::Idle);

        debug!(duration_us = start.elapsed().as_micros(), "Guest call returned");
        decoded
    }
}

/// Encode `args` and check them and `R` against the declared signature.
///
/// Runs before the guest is entered, so a mismatch leaves it untouched.
fn encode<R: CallResults, A: CallArgs>(ty: &FuncType, args: A) -> Result<Vec<Val>, RuntimeError> {
    let values = args.encode();

    if ty.params().len() != values.len() {
        return Err(RuntimeError::type_mismatch(
            format!("{} arguments", ty.params().len()),
            format!("{} arguments", values.len()),
        ));
    }

    for (declared, value) in ty.params().zip(&values) {
        match ValueKind::of(&declared) {
            Some(kind) if kind == value.kind() => {}
            Some(kind) => {
                return Err(RuntimeError::type_mismatch(
                    kind.to_string(),
                    value.kind().to_string(),
                ));
            }
            None => {
                return Err(RuntimeError::type_mismatch(
                    "numeric parameter",
                    value.kind().to_string(),
                ));
            }
        }
    }

    if ty.results().len() != R::ARITY {
        return Err(RuntimeError::type_mismatch(
            format!("{} results", R::ARITY),
            format!("{} results", ty.results().len()),
        ));
    }

    for (declared, requested) in ty.results().zip(R::kinds()) {
        match ValueKind::of(&declared) {
            Some(kind) if kind == requested => {}
            Some(kind) => {
                return Err(RuntimeError::type_mismatch(
                    requested.to_string(),
                    kind.to_string(),
                ));
            }
            None => {
                return Err(RuntimeError::type_mismatch(
                    requested.to_string(),
                    "non-numeric result",
                ));
            }
        }
    }

    Ok(values.into_iter().map(Val::from).collect())
}
