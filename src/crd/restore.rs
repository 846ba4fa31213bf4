//! Restore Custom Resource Definition
//!
//! A Restore replays a completed Backup into a running cluster. It mounts
//! the Backup's existing claim instead of provisioning a new one.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ContainerSpec, OperationStatus, ResourceFilter};

/// Specification for a Restore
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "oneshot.dev",
    version = "v1alpha1",
    kind = "Restore",
    plural = "restores",
    shortname = "ors",
    namespaced,
    status = "OperationStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Backup","type":"string","jsonPath":".spec.backup"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Name of the cluster to restore into
    pub cluster: String,

    /// Name of a Backup in the same namespace
    pub backup: String,

    /// Worker container resource limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,

    /// Resources to restore; unset restores everything in the backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceFilter>,
}

impl RestoreSpec {
    /// Fill unset optional fields
    pub fn apply_defaults(&mut self) {
        self.container
            .get_or_insert_with(ContainerSpec::default)
            .apply_defaults();
    }
}
