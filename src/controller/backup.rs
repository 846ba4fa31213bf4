//! Backup adapter
//!
//! A Backup provisions its own claim (named after the Backup), mounts it
//! read-write in the worker and asks the agent to write the selected
//! resources into it.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use tracing::debug;

use super::{
    load_with_defaults, object_ref, record_volume_ref, worker_labels, write_phase, ResourceStore,
};
use crate::adapter::{ObjectKey, OperationAdapter};
use crate::compute::{ComputeSpec, ComputeVolume, DataSource};
use crate::crd::{Backup, OperationPhase, OperationResource};
use crate::exec::{AgentTarget, ExecutionClient, OperationRequest};
use crate::storage::{StorageProvisioner, VolumeClient, VolumeRequest};
use crate::{Error, Result, DATA_MOUNT_PATH};

/// Drives [`Backup`] resources
pub struct BackupAdapter<C> {
    store: Arc<dyn ResourceStore<Backup>>,
    storage: StorageProvisioner<C>,
}

impl<C: VolumeClient> BackupAdapter<C> {
    /// Create an adapter over the given store and storage provisioner
    pub fn new(store: Arc<dyn ResourceStore<Backup>>, storage: StorageProvisioner<C>) -> Self {
        Self { store, storage }
    }
}

#[async_trait]
impl<C: VolumeClient> OperationAdapter for BackupAdapter<C> {
    type Resource = Backup;

    fn kind(&self) -> &'static str {
        "Backup"
    }

    async fn load(&self, key: &ObjectKey) -> Result<Option<Backup>> {
        load_with_defaults(self.store.as_ref(), key).await
    }

    fn target_cluster(&self, backup: &Backup) -> String {
        backup.cluster().to_string()
    }

    fn current_phase(&self, backup: &Backup) -> OperationPhase {
        backup.phase()
    }

    fn object_ref(&self, backup: &Backup) -> ObjectReference {
        object_ref(backup)
    }

    fn spec_changed(&self, backup: &Backup) -> bool {
        backup.spec_changed()
    }

    async fn advance_phase(
        &self,
        backup: &Backup,
        phase: OperationPhase,
        reason: Option<&Error>,
    ) -> Result<()> {
        write_phase(self.store.as_ref(), backup, phase, reason).await
    }

    async fn init(&self, backup: &Backup) -> Result<ComputeSpec> {
        let key = ObjectKey::for_resource(backup)?;
        let owner = backup.controller_owner_ref(&()).ok_or_else(|| {
            Error::internal_with_context("owner-reference", format!("{key} has no uid"))
        })?;
        let volume = backup.spec.volume.clone().unwrap_or_default();

        let outcome = self
            .storage
            .ensure_volume(&VolumeRequest {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
                storage: volume.storage,
                storage_class: volume.storage_class_name,
                owner: owner.clone(),
                labels: worker_labels("backup", &key.name, &self.target_cluster(backup)),
            })
            .await?;
        debug!(operation = %key, ?outcome, "backup volume ensured");

        record_volume_ref(self.store.as_ref(), backup, format!("pvc/{}", key.name)).await?;

        Ok(ComputeSpec {
            volume: ComputeVolume {
                mount_path: DATA_MOUNT_PATH.to_string(),
                source: DataSource::Claim(key.name.clone()),
                read_only: false,
                update_permissions: true,
            },
            container: backup.spec.container.clone().unwrap_or_default(),
            labels: worker_labels("backup", &key.name, &self.target_cluster(backup)),
            owner: Some(owner),
        })
    }

    async fn invoke(
        &self,
        exec: &dyn ExecutionClient,
        target: &AgentTarget,
        backup: &Backup,
    ) -> Result<()> {
        let request = OperationRequest {
            directory: DATA_MOUNT_PATH.to_string(),
            resource_filter: backup.spec.resources.clone().unwrap_or_default(),
        };
        exec.invoke(target, &backup.name_any(), &request)
            .await
    }

    async fn poll(
        &self,
        exec: &dyn ExecutionClient,
        target: &AgentTarget,
        backup: &Backup,
    ) -> Result<OperationPhase> {
        Ok(exec
            .status(target, &backup.name_any())
            .await?
            .into())
    }
}
