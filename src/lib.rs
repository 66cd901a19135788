//! Appmon - mutating admission webhook for application monitoring
//!
//! Injects application monitoring auto-instrumentation into Kubernetes
//! workloads. Each admitted Deployment is first stripped of anything an
//! earlier mutation injected, then, when an Instrumentation resource in its
//! namespace governs it, given the agent init containers, volumes and
//! environment for the requested platforms.
//!
//! # Modules
//!
//! - [`mutation`] - Mutation catalog, configuration resolver and patch/unpatch engine
//! - [`webhook`] - Admission review orchestration and HTTPS router
//! - [`store`] - Watched, in-memory store of Instrumentation resources
//! - [`crd`] - Instrumentation custom resource
//! - [`cluster`] - Identity of the hosting cluster
//! - [`telemetry`] - Tracing setup and heartbeat counters
//! - [`certs`] - Webhook serving certificate management
//! - [`pki`] - CA and certificate generation
//! - [`cleanup`] - Reverting every mutated workload
//! - [`retry`] - Backoff for API server calls
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod certs;
pub mod cleanup;
pub mod cluster;
pub mod crd;
pub mod error;
pub mod mutation;
pub mod pki;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port of the HTTPS admission endpoint
pub const DEFAULT_WEBHOOK_PORT: u16 = 1337;

/// Default heartbeat flush interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 300;
