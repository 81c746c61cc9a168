//! JuiceFS cache group operator
//!
//! A Kubernetes operator that keeps one JuiceFS cache worker running on every
//! eligible node of a `CacheGroup`, rolls workers forward when their
//! specification drifts, and runs `WarmUp` jobs that preload paths into an
//! existing cache group.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (CacheGroup, WarmUp, Sync)
//! - [`builder`] - Pure builders for worker pods, warm-up jobs and sync secrets
//! - [`controller`] - Reconciliation logic for every CRD
//! - [`runner`] - Controller wiring and graceful shutdown
//! - [`naming`] - Well-known labels, annotations and name derivations
//! - [`error`] - Error types for the operator

#![warn(missing_docs)]

pub mod builder;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod hash;
pub mod naming;
pub mod options;
pub mod retry;
pub mod runner;
pub mod secret;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "juicefs-cache-group-operator";
