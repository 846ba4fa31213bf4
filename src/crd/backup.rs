//! Backup Custom Resource Definition
//!
//! A Backup copies the selected resources of a running cluster onto a
//! dedicated volume claim, using one transient worker pod.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ContainerSpec, OperationStatus, ResourceFilter, VolumeSpec};

/// Specification for a Backup
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "oneshot.dev",
    version = "v1alpha1",
    kind = "Backup",
    plural = "backups",
    shortname = "obk",
    namespaced,
    status = "OperationStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Volume","type":"string","jsonPath":".status.volumeRef"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Name of the cluster to back up
    pub cluster: String,

    /// Volume size and class override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeSpec>,

    /// Worker container resource limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerSpec>,

    /// Resources to include; unset backs up everything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceFilter>,
}

impl BackupSpec {
    /// Fill unset optional fields so downstream code never sees `None`
    /// for volume or container
    pub fn apply_defaults(&mut self) {
        self.volume.get_or_insert_with(VolumeSpec::default);
        self.container
            .get_or_insert_with(ContainerSpec::default)
            .apply_defaults();
    }
}
