//! wasm-sandbox CLI entry point.
//!
//! Runs the plain and the instrumented build of a guest program through the
//! sandbox and prints what the guest prints.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wasm_sandbox_common::ConfigFile;
use wasm_sandbox_core::{PrintSink, Runtime, TimestampSource};
use wasm_sandbox_host::{
    HeaderSink, MonotonicClock, SandboxNatives, StdoutSink, SystemClock, read_bytecode,
    run_benchmark,
};

/// Run a guest program's plain and instrumented builds in the sandbox.
#[derive(Debug, Parser)]
#[command(name = "wasm-sandbox", version, about)]
struct Cli {
    /// Plain build of the guest program (.wasm).
    plain: PathBuf,

    /// Instrumented build of the same program (.wasm).
    instrumented: PathBuf,

    /// TOML configuration file.
    #[arg(short, long, env = "WASM_SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Runs per build.
    #[arg(long, env = "WASM_SANDBOX_REPEAT")]
    repeat: Option<u32>,

    /// Instruction threshold for the instrumented build.
    #[arg(long, env = "WASM_SANDBOX_THRESHOLD")]
    threshold: Option<u64>,

    /// Event identifier handed to the guest.
    #[arg(long)]
    event_id: Option<String>,

    /// Event payload handed to the guest.
    #[arg(long)]
    payload: Option<String>,

    /// Prefix for every line the guest prints.
    #[arg(long)]
    header: Option<String>,

    /// Report benchmark timestamps as microseconds since the Unix epoch.
    #[arg(long)]
    system_clock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wasm_sandbox=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    info!("Starting wasm-sandbox");

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)?,
        None => ConfigFile::default(),
    };

    if let Some(repeat) = cli.repeat {
        config.run.repeat = repeat;
    }
    if let Some(threshold) = cli.threshold {
        config.run.threshold = threshold;
    }
    if let Some(event_id) = cli.event_id {
        config.run.event_id = event_id;
    }
    if let Some(payload) = cli.payload {
        config.run.event_payload = payload;
    }
    if cli.header.is_some() {
        config.run.print_header = cli.header;
    }

    info!(
        heap_size_bytes = config.runtime.heap_size_bytes,
        repeat = config.run.repeat,
        threshold = config.run.threshold,
        "Configuration loaded"
    );

    let mut sink: Arc<dyn PrintSink> = Arc::new(StdoutSink);
    if let Some(header) = &config.run.print_header {
        sink = Arc::new(HeaderSink::new(header.as_str(), sink));
    }
    let clock: Arc<dyn TimestampSource> = if cli.system_clock {
        Arc::new(SystemClock)
    } else {
        Arc::new(MonotonicClock::new())
    };

    // Guest calls block the calling thread
    let report = tokio::task::spawn_blocking(move || {
        let plain = read_guest(&cli.plain)?;
        let instrumented = read_guest(&cli.instrumented)?;
        let runtime = Runtime::create(&config.runtime, sink, clock, &SandboxNatives)
            .context("Failed to create runtime")?;
        Ok::<_, anyhow::Error>(run_benchmark(&runtime, &config.run, &plain, &instrumented))
    })
    .await
    .context("Benchmark task panicked")??;

    if let Some(error) = report.error {
        warn!(
            plain_runs = report.plain.len(),
            instrumented_runs = report.instrumented.len(),
            "Benchmark incomplete"
        );
        return Err(error).context("Benchmark failed");
    }

    info!(
        plain_runs = report.plain.len(),
        instrumented_runs = report.instrumented.len(),
        "Benchmark complete"
    );

    Ok(())
}

fn read_guest(path: &Path) -> anyhow::Result<Vec<u8>> {
    read_bytecode(path).with_context(|| format!("Failed to read Wasm file '{}'", path.display()))
}
