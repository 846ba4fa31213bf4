//! oneshot - Kubernetes operator for one-shot administrative operations
//!
//! A one-shot operation (a backup, a restore) is declared as a custom
//! resource. The operator provisions what the operation needs (a volume
//! claim and a transient worker pod), asks the agent to run it, and polls
//! until the agent reports a terminal state. Progress is persisted in the
//! resource's `status.phase`, so a restarted operator resumes where the
//! previous one stopped.
//!
//! # Architecture
//!
//! A single generic [`engine::Engine`] drives every kind through the same
//! phase machine ([`phase`]). Kind-specific behavior lives behind the
//! [`adapter::OperationAdapter`] trait:
//!
//! - [`controller::BackupAdapter`] provisions a claim and writes into it
//! - [`controller::RestoreAdapter`] mounts the claim of a finished backup
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Backup, Restore)
//! - [`adapter`] - Per-kind contract consumed by the engine
//! - [`engine`] - Generic reconciliation pass
//! - [`phase`] - Phase transition rules
//! - [`storage`] - Volume claim provisioning
//! - [`compute`] - Worker pod provisioning and readiness
//! - [`exec`] - HTTP client for the remote agent
//! - [`events`] - Kubernetes Events for phase changes
//! - [`controller`] - kube-runtime wiring and the concrete adapters
//! - [`retry`] - Backoff helper
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod adapter;
pub mod compute;
pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod events;
pub mod exec;
pub mod phase;
pub mod retry;
pub mod storage;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared constants
// =============================================================================

/// Where the worker mounts the operation's data volume
pub const DATA_MOUNT_PATH: &str = "/opt/oneshot/backups";

/// Default port of the remote agent
pub const DEFAULT_AGENT_PORT: u16 = 8080;

/// Field manager used for status patches and CRD installation
pub const FIELD_MANAGER: &str = "oneshot-controller";

/// Standard label marking objects created by the operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on operator-owned objects
pub const MANAGED_BY_VALUE: &str = "oneshot";

/// Label carrying the target cluster name on worker pods
pub const CLUSTER_LABEL: &str = "oneshot.dev/cluster";

/// Label carrying the operation kind (`backup`, `restore`) on worker pods
pub const OPERATION_LABEL: &str = "oneshot.dev/operation";
