//! homewatch-core: Core library for homewatch
//!
//! Resilience core shared by home telemetry collectors: bounded retries,
//! idempotent reading storage, a hand-editable device registry, size-bounded
//! log rotation and an aggregated health check.
//!
//! # Architecture
//!
//! ```text
//! Collector → Retry Executor → vendor API
//!     ↓
//! Device Registry (names) → Reading → Persistent Store (SQLite/WAL)
//!     ↓
//! tracing → Rotating log file          Health Check ← validators
//! ```
//!
//! # Modules
//!
//! - `retry`: Backoff policy and execute-with-policy helpers
//! - `storage`: SQLite reading store with range checks and duplicate suppression
//! - `registry`: YAML device registry with name inference
//! - `rotation`: Size-bounded rotating log file sink
//! - `health`: Validator coordinator and built-in validators
//! - `reading`: Reading and device type model
//! - `alerts`: Alert artifacts for external monitoring
//! - `redact`: Secret masking for operator-facing output
//! - `config`: TOML configuration
//! - `logging`: `tracing` subscriber setup
//! - `error`: Error types, classification and remediation
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod alerts;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod reading;
pub mod redact;
pub mod registry;
pub mod retry;
pub mod rotation;
pub mod storage;

pub use error::{Classify, Error, ErrorKind, Result, StorageError};
pub use reading::{DeviceType, Reading};
pub use retry::{RetryPolicy, with_retry, with_retry_async};
