//! Stratos - compute-provider agent for a decentralized compute marketplace
//!
//! A Stratos instance governs a single Kubernetes cluster. It accepts workload
//! requests from the marketplace, compiles them into an isolated set of
//! cluster objects, tracks fine-grained resource usage (heterogeneous GPUs
//! included), enforces an admission policy that decides whether the provider
//! advertises itself as available, and supervises every running workload's
//! lifecycle including expiry-driven teardown.
//!
//! # Architecture
//!
//! Three subsystems form the provider's control loop:
//! - The workload compiler turns an abstract workload description (container
//!   image, compose-like manifest, or model-inference request) into namespace,
//!   deployment, service, and ingress objects with GPU-aware placement.
//! - The resource accountant inventories node capacity and per-node GPU
//!   attachment, nets out what running workloads consume, and evaluates the
//!   quota policy into an Active/Inactive admission verdict.
//! - The lifecycle manager tracks every accepted job (in memory for fast
//!   polling, in the durable record store for crash recovery), reports status
//!   upstream, and runs the expiry and namespace-reclamation watchdogs.
//!
//! # Modules
//!
//! - [`accountant`] - Resource snapshots, GPU telemetry, admission policy
//! - [`cluster`] - Typed wrapper over the Kubernetes API
//! - [`compiler`] - Workload compilation into cluster objects
//! - [`config`] - Provider configuration and resource policy loading
//! - [`context`] - Shared provider context constructed once at startup
//! - [`hardware`] - Hardware-tier description parsing
//! - [`lifecycle`] - Job tracking, status reporting, watchdogs
//! - [`manifest`] - Versioned deployment manifest parsing
//! - [`retry`] - Retry utilities for transient failures
//! - [`store`] - Durable job records
//! - [`upstream`] - Marketplace coordinator client
//! - [`error`] - Error types for the agent

#![deny(missing_docs)]

use std::time::Duration;

pub mod accountant;
pub mod cluster;
pub mod compiler;
pub mod config;
pub mod context;
pub mod error;
pub mod hardware;
pub mod lifecycle;
pub mod manifest;
pub mod retry;
pub mod store;
pub mod upstream;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Naming Conventions
// =============================================================================
// Every cluster object created for a workload derives its name from the
// workload (space) UUID, so teardown can address the full object set from a
// durable record alone.

/// Prefix for per-wallet namespaces (`stratos-ns-<lowercased wallet>`)
pub const NAMESPACE_PREFIX: &str = "stratos-ns-";

/// Prefix for workload Deployment names
pub const DEPLOY_NAME_PREFIX: &str = "deploy-";

/// Prefix for workload Service names
pub const SERVICE_NAME_PREFIX: &str = "svc-";

/// Prefix for workload Ingress names
pub const INGRESS_NAME_PREFIX: &str = "ing-";

/// Prefix for workload container names
pub const CONTAINER_NAME_PREFIX: &str = "ctr-";

/// Label applied to every workload pod, keyed by workload UUID
///
/// All teardown and status queries select on `stratos.dev/workload=<uuid>`.
pub const WORKLOAD_LABEL: &str = "stratos.dev/workload";

/// Value of the `app.kubernetes.io/managed-by` label on created objects
pub const MANAGED_BY: &str = "stratos";

// =============================================================================
// Timing
// =============================================================================

/// Interval between per-job status reports to the coordinator
pub const JOB_REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Interval between job URL polls that retire completed jobs
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(180);

/// Interval between expiry-watchdog scans of the durable records
pub const EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between namespace-reclamation passes
pub const NAMESPACE_RECLAIM_INTERVAL: Duration = Duration::from_secs(3600);

/// Interval between cluster resource summaries pushed upstream
pub const RESOURCE_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between admission-status pushes upstream
pub const PROVIDER_STATUS_INTERVAL: Duration = Duration::from_secs(15);

/// A job polled more times than this is dropped from tracking
pub const MAX_JOB_POLL_COUNT: u32 = 50;

/// Container port used by model-inference workloads, which declare no ports
pub const INFERENCE_CONTAINER_PORT: i32 = 80;
