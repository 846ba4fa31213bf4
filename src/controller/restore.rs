//! Restore adapter
//!
//! A Restore provisions nothing of its own: it mounts the claim of a
//! Succeeded Backup in the same namespace and asks the agent to load the
//! selected resources from it.

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
use crate::crd::{Backup, OperationPhase, OperationResource, Restore};
use crate::exec::{AgentTarget, ExecutionClient, OperationRequest};
use crate::{Error, Result, DATA_MOUNT_PATH};

/// Drives [`Restore`] resources
pub struct RestoreAdapter {
    store: Arc<dyn ResourceStore<Restore>>,
    backups: Arc<dyn ResourceStore<Backup>>,
}

impl RestoreAdapter {
    /// Create an adapter; `backups` resolves `spec.backup`
    pub fn new(
        store: Arc<dyn ResourceStore<Restore>>,
        backups: Arc<dyn ResourceStore<Backup>>,
    ) -> Self {
        Self { store, backups }
    }

    /// Resolve the referenced Backup, requiring it to have succeeded
    async fn source_backup(&self, key: &ObjectKey, restore: &Restore) -> Result<Backup> {
        let backup_key = ObjectKey::new(&key.namespace, &restore.spec.backup);
        let backup = self.backups.get(&backup_key).await?.ok_or_else(|| {
            Error::configuration_for_field(
                &key.name,
                "spec.backup",
                format!("backup {backup_key} not found"),
            )
        })?;

        match backup.phase() {
            OperationPhase::Succeeded => Ok(backup),
            OperationPhase::Failed => Err(Error::configuration_for_field(
                &key.name,
                "spec.backup",
                format!("backup {backup_key} failed and cannot be restored"),
            )),
            phase => Err(Error::waiting(
                format!("backup/{}", restore.spec.backup),
                format!("phase is {phase}"),
            )),
        }
    }
}

#[async_trait]
impl OperationAdapter for RestoreAdapter {
    type Resource = Restore;

    fn kind(&self) -> &'static str {
        "Restore"
    }

    async fn load(&self, key: &ObjectKey) -> Result<Option<Restore>> {
        load_with_defaults(self.store.as_ref(), key).await
    }

    fn target_cluster(&self, restore: &Restore) -> String {
        restore.cluster().to_string()
    }

    fn current_phase(&self, restore: &Restore) -> OperationPhase {
        restore.phase()
    }

    fn object_ref(&self, restore: &Restore) -> ObjectReference {
        object_ref(restore)
    }

    fn spec_changed(&self, restore: &Restore) -> bool {
        restore.spec_changed()
    }

    async fn advance_phase(
        &self,
        restore: &Restore,
        phase: OperationPhase,
        reason: Option<&Error>,
    ) -> Result<()> {
        write_phase(self.store.as_ref(), restore, phase, reason).await
    }

    async fn init(&self, restore: &Restore) -> Result<ComputeSpec> {
        let key = ObjectKey::for_resource(restore)?;
        let owner = restore.controller_owner_ref(&()).ok_or_else(|| {
            Error::internal_with_context("owner-reference", format!("{key} has no uid"))
        })?;

        let backup = self.source_backup(&key, restore).await?;
        let claim = backup.name_any();
        debug!(operation = %key, %claim, "restoring from backup claim");

        record_volume_ref(self.store.as_ref(), restore, format!("pvc/{claim}")).await?;

        Ok(ComputeSpec {
            volume: ComputeVolume {
                mount_path: DATA_MOUNT_PATH.to_string(),
                source: DataSource::Claim(claim),
                read_only: true,
                update_permissions: false,
            },
            container: restore.spec.container.clone().unwrap_or_default(),
            labels: worker_labels("restore", &key.name, &self.target_cluster(restore)),
            owner: Some(owner),
        })
    }

    async fn invoke(
        &self,
        exec: &dyn ExecutionClient,
        target: &AgentTarget,
        restore: &Restore,
    ) -> Result<()> {
        let request = OperationRequest {
            directory: DATA_MOUNT_PATH.to_string(),
            resource_filter: restore.spec.resources.clone().unwrap_or_default(),
        };
        exec.invoke(target, &restore.name_any(), &request)
            .await
    }

    async fn poll(
        &self,
        exec: &dyn ExecutionClient,
        target: &AgentTarget,
        restore: &Restore,
    ) -> Result<OperationPhase> {
        Ok(exec
            .status(target, &restore.name_any())
            .await?
            .into())
    }
}
