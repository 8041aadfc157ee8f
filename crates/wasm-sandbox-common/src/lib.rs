//! Common types, errors, and configuration for wasm-sandbox.
//!
//! This crate provides shared functionality used across the wasm-sandbox workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for runtime and run settings
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{ModuleConfig, RunConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError};
pub use error::{ExportKind, FaultKind, Resource, RuntimeError, TimestampError};
