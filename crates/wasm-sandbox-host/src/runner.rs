//! Orchestration of a guest program's entry points.
//!
//! A [`MainRunner`] owns one module, one instance and one execution
//! environment carrying the event. [`run_benchmark`] drives a plain and an
//! instrumented build of the same program through a runner each.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use crate::abi;
use crate::instrumentation::{read_counter, reset_counters};
use wasm_sandbox_common::{FaultKind, ModuleConfig, RunConfig, RuntimeError};
use wasm_sandbox_core::{
    ExecutionEnvironment, Module, ModuleInstance, PrintSink, Runtime, SharedHandle, UserData,
};

/// How an entry point finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The entry point returned this status.
    Returned(i32),
    /// The guest called `exit` with this status.
    Exited(i32),
    /// The instruction counter passed the threshold.
    ThresholdExceeded {
        /// Counter value when the guest halted.
        counter: u64,
        /// Threshold the run was started with.
        threshold: u64,
    },
}

impl RunOutcome {
    /// The status the program ended with, if it ended on its own.
    pub fn status(&self) -> Option<i32> {
        match self {
            RunOutcome::Returned(status) | RunOutcome::Exited(status) => Some(*status),
            RunOutcome::ThresholdExceeded { .. } => None,
        }
    }
}

/// Runs the entry points of one guest program.
///
/// The event id and payload are stored NUL-terminated, so guests can hand
/// the buffers straight to `sandbox_print`.
pub struct MainRunner {
    sink: Arc<dyn PrintSink>,
    env: ExecutionEnvironment,
    instance: SharedHandle<ModuleInstance>,
    module: SharedHandle<Module>,
    threshold: u64,
    counter: u64,
}

impl MainRunner {
    /// Load `bytecode`, instantiate it and bind an environment carrying
    /// the event.
    ///
    /// # Errors
    ///
    /// Returns `ResourceInitialization` if any layer fails to come up,
    /// `Allocation` if the event does not fit a 32-bit guest.
    #[instrument(skip_all, fields(bytecode_len = bytecode.len()))]
    pub fn new(
        runtime: &SharedHandle<Runtime>,
        bytecode: &[u8],
        event_id: &[u8],
        event_payload: &[u8],
        module_config: &ModuleConfig,
        exec_stack_size: u32,
    ) -> Result<Self, RuntimeError> {
        let module = runtime.load_module(bytecode)?;
        let instance = module.instantiate(module_config.stack_size, module_config.heap_size)?;
        let mut env = instance.create_execution_environment(exec_stack_size)?;
        env.set_user_data(UserData::with_event(
            nul_terminated(event_id),
            nul_terminated(event_payload),
        )?);

        Ok(Self {
            sink: runtime.sink(),
            env,
            instance,
            module,
            threshold: 0,
            counter: 0,
        })
    }

    /// The module being run.
    pub fn module(&self) -> &SharedHandle<Module> {
        &self.module
    }

    /// The instance the entry points run in.
    pub fn instance(&self) -> &SharedHandle<ModuleInstance> {
        &self.instance
    }

    /// The environment the entry points are called through.
    pub fn environment(&self) -> &ExecutionEnvironment {
        &self.env
    }

    /// Threshold of the last instrumented run.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Counter read after the last instrumented run.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn event_lens(&self) -> (u32, u32) {
        let user_data = self.env.user_data();
        (user_data.event_id_len(), user_data.event_payload_len())
    }

    /// Call `sandbox_main(id_len, payload_len)`.
    ///
    /// # Errors
    ///
    /// Returns any invocation error except the expected halts, which are
    /// cleared and reported as [`RunOutcome`]s.
    pub fn run_plain(&mut self) -> Result<RunOutcome, RuntimeError> {
        self.sink.print_str("\n\nRunning plain wasm...\n");

        let (id_len, payload_len) = self.event_lens();
        let result = self
            .env
            .execute_function::<(i32,), _>(abi::MAIN, (id_len, payload_len));
        self.settle(result)
    }

    /// Call `sandbox_instrumented_main(id_len, payload_len, threshold)` and
    /// print the counter afterwards.
    ///
    /// # Errors
    ///
    /// Returns any invocation error except the expected halts, or the
    /// counter global's lookup error.
    pub fn run_instrumented(&mut self, threshold: u64) -> Result<RunOutcome, RuntimeError> {
        self.threshold = threshold;
        self.sink.print_str("\n\nRunning instrumented wasm...\n");

        let (id_len, payload_len) = self.event_lens();
        let result = self.env.execute_function::<(i32,), _>(
            abi::INSTRUMENTED_MAIN,
            (id_len, payload_len, threshold),
        );
        let outcome = self.settle(result)?;

        self.counter = read_counter(&self.instance)?;
        self.sink.print_str(&format!(
            "Threshold: {}, Counter: {}\n",
            self.threshold, self.counter
        ));

        Ok(match outcome {
            RunOutcome::ThresholdExceeded { .. } => RunOutcome::ThresholdExceeded {
                counter: self.counter,
                threshold,
            },
            other => other,
        })
    }

    /// Zero the instrumentation globals and the recorded values.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`reset_counters`].
    pub fn reset_threshold_and_counter(&mut self) -> Result<(), RuntimeError> {
        reset_counters(&self.instance)?;
        self.env.user_data_mut().reset_instrumentation();
        self.threshold = 0;
        self.counter = 0;
        Ok(())
    }

    /// Turn expected halts into outcomes and clear their latched exception.
    fn settle(&self, result: Result<(i32,), RuntimeError>) -> Result<RunOutcome, RuntimeError> {
        let error = match result {
            Ok((status,)) => return Ok(RunOutcome::Returned(status)),
            Err(error) => error,
        };

        let outcome = match error.fault_kind() {
            Some(FaultKind::Exit(status)) => RunOutcome::Exited(status),
            Some(FaultKind::CounterExceeded) => RunOutcome::ThresholdExceeded {
                counter: self.env.user_data().instruction_count(),
                threshold: self.threshold,
            },
            _ => return Err(error),
        };

        self.instance.clear_exception()?;
        info!(?outcome, "Guest halted");
        Ok(outcome)
    }
}

impl std::fmt::Debug for MainRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainRunner")
            .field("content_hash", &self.module.content_hash())
            .field("instance_id", &self.instance.id())
            .field("threshold", &self.threshold)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

fn nul_terminated(bytes: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(bytes.len() + 1);
    buffer.extend_from_slice(bytes);
    buffer.push(0);
    buffer
}

/// Outcomes of a [`run_benchmark`] pass.
#[derive(Debug, Default)]
pub struct BenchmarkReport {
    /// One outcome per completed plain run.
    pub plain: Vec<RunOutcome>,
    /// One outcome per completed instrumented run.
    pub instrumented: Vec<RunOutcome>,
    /// The error that stopped the pass, if any.
    pub error: Option<RuntimeError>,
}

impl BenchmarkReport {
    /// Returns `true` if every run completed.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Read a guest program's bytecode from disk.
///
/// # Errors
///
/// Returns `Io` if the file cannot be read.
pub fn read_bytecode(path: impl AsRef<Path>) -> Result<Vec<u8>, RuntimeError> {
    let bytecode = std::fs::read(path.as_ref())?;
    debug!(path = %path.as_ref().display(), bytes_len = bytecode.len(), "Bytecode read");
    Ok(bytecode)
}

/// Run the plain program `run.repeat` times, then the instrumented one.
///
/// Instrumented runs are started with `run.threshold` and their counters
/// are reset after each run. The first error stops the pass; it is logged
/// and recorded in the report.
#[instrument(skip_all, fields(repeat = run.repeat, threshold = run.threshold))]
pub fn run_benchmark(
    runtime: &SharedHandle<Runtime>,
    run: &RunConfig,
    plain: &[u8],
    instrumented: &[u8],
) -> BenchmarkReport {
    let start = Instant::now();
    let mut report = BenchmarkReport::default();

    if let Err(e) = run_all(runtime, run, plain, instrumented, &mut report) {
        error!(error = %e, "Benchmark failed");
        report.error = Some(e);
    }

    info!(
        plain_runs = report.plain.len(),
        instrumented_runs = report.instrumented.len(),
        success = report.is_success(),
        duration_ms = start.elapsed().as_millis(),
        "Benchmark finished"
    );
    report
}

fn run_all(
    runtime: &SharedHandle<Runtime>,
    run: &RunConfig,
    plain: &[u8],
    instrumented: &[u8],
    report: &mut BenchmarkReport,
) -> Result<(), RuntimeError> {
    let sink = runtime.sink();
    let config = runtime.config();

    {
        let mut runner = MainRunner::new(
            runtime,
            plain,
            run.event_id.as_bytes(),
            run.event_payload.as_bytes(),
            &config.module,
            config.exec_stack_size,
        )?;
        for _ in 0..run.repeat {
            sink.print_str("\n\nStarting to run WASM program (type=plain)...\n");
            let outcome = runner.run_plain()?;
            sink.print_str("Finished to run WASM program (type=plain)...\n");
            report.plain.push(outcome);
        }
    }

    {
        let mut runner = MainRunner::new(
            runtime,
            instrumented,
            run.event_id.as_bytes(),
            run.event_payload.as_bytes(),
            &config.module,
            config.exec_stack_size,
        )?;
        for _ in 0..run.repeat {
            sink.print_str("\n\nStarting to run WASM program (type=instrumented)...\n");
            let outcome = runner.run_instrumented(run.threshold)?;
            if let RunOutcome::ThresholdExceeded { counter, threshold } = outcome {
                warn!(counter, threshold, "Instrumented run stopped at threshold");
            }
            runner.reset_threshold_and_counter()?;
            sink.print_str("Finished to run WASM program (type=instrumented)...\n");
            report.instrumented.push(outcome);
        }
    }

    Ok(())
}
