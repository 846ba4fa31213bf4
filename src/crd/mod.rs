//! Custom Resource Definitions for oneshot
//!
//! Every operation kind shares [`OperationStatus`]; only the spec differs.
//! [`OperationResource`] is the common view the controllers work with.

mod backup;
mod restore;
mod types;

use std::fmt::Debug;

use kube::core::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use backup::{Backup, BackupSpec};
pub use restore::{Restore, RestoreSpec};
pub use types::{
    ContainerSpec, OperationPhase, OperationStatus, ResourceFilter, VolumeSpec,
    DEFAULT_CONTAINER_CPU, DEFAULT_CONTAINER_MEMORY,
};

/// Shape shared by every operation CRD
pub trait OperationResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Cluster the operation acts against
    fn cluster(&self) -> &str;

    /// Persisted status, if any was written yet
    fn operation_status(&self) -> Option<&OperationStatus>;

    /// Fill unset optional spec fields
    fn apply_defaults(&mut self);

    /// Persisted phase, `Initializing` before the first status write
    fn phase(&self) -> OperationPhase {
        self.operation_status()
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    /// True if the spec generation moved past the one the status describes
    fn spec_changed(&self) -> bool {
        match (
            self.meta().generation,
            self.operation_status().and_then(|s| s.observed_generation),
        ) {
            (Some(current), Some(observed)) => current != observed,
            _ => false,
        }
    }
}

impl OperationResource for Backup {
    fn cluster(&self) -> &str {
        &self.spec.cluster
    }

    fn operation_status(&self) -> Option<&OperationStatus> {
        self.status.as_ref()
    }

    fn apply_defaults(&mut self) {
        self.spec.apply_defaults();
    }
}

impl OperationResource for Restore {
    fn cluster(&self) -> &str {
        &self.spec.cluster
    }

    fn operation_status(&self) -> Option<&OperationStatus> {
        self.status.as_ref()
    }

    fn apply_defaults(&mut self) {
        self.spec.apply_defaults();
    }
}
