//! Controllers for operation resources
//!
//! Each kind gets an [`OperationAdapter`](crate::adapter::OperationAdapter)
//! implementation; the reconcile and error-policy functions here are
//! generic over it and plug a shared [`Engine`] into a kube-runtime
//! `Controller`.

pub mod backup;
pub mod restore;

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument};

use crate::adapter::{ObjectKey, OperationAdapter};
use crate::crd::{OperationPhase, OperationResource, OperationStatus};
use crate::engine::Engine;
use crate::phase::validate_transition;
use crate::{
    Error, Result, CLUSTER_LABEL, FIELD_MANAGER, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    OPERATION_LABEL,
};

pub use backup::BackupAdapter;
pub use restore::RestoreAdapter;

/// Read and status-write access to operation resources of one kind
#[async_trait]
pub trait ResourceStore<K: OperationResource>: Send + Sync {
    /// Fetch a resource, `Ok(None)` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// Replace the resource's status
    async fn patch_status(&self, key: &ObjectKey, status: &OperationStatus) -> Result<()>;
}

/// Kube-backed [`ResourceStore`]
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K: OperationResource> ResourceStore<K> for KubeStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn patch_status(&self, key: &ObjectKey, status: &OperationStatus) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            &key.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }
}

/// Labels identifying an operation's worker
pub fn worker_labels(kind: &str, name: &str, cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
        (OPERATION_LABEL.to_string(), kind.to_string()),
        (format!("oneshot.dev/{kind}"), name.to_string()),
    ])
}

/// Load a resource with its defaults applied
pub(crate) async fn load_with_defaults<K: OperationResource>(
    store: &dyn ResourceStore<K>,
    key: &ObjectKey,
) -> Result<Option<K>> {
    Ok(store.get(key).await?.map(|mut resource| {
        resource.apply_defaults();
        resource
    }))
}

/// Event reference for any operation resource
pub(crate) fn object_ref<K: OperationResource>(resource: &K) -> ObjectReference {
    resource.object_ref(&())
}

/// Persist `phase` and `reason` using read-compare-write
///
/// The resource is re-read first; nothing is written when phase and reason
/// already match, and a resource deleted in the meantime is not an error.
pub(crate) async fn write_phase<K: OperationResource>(
    store: &dyn ResourceStore<K>,
    resource: &K,
    phase: OperationPhase,
    reason: Option<&Error>,
) -> Result<()> {
    let key = ObjectKey::for_resource(resource)?;
    let Some(fresh) = store.get(&key).await? else {
        debug!(operation = %key, "resource gone, skipping status write");
        return Ok(());
    };

    let current = fresh.operation_status().cloned().unwrap_or_default();
    let reason = reason.map(ToString::to_string).unwrap_or_default();
    if current.phase == phase && current.reason == reason {
        debug!(operation = %key, %phase, "status already current");
        return Ok(());
    }
    validate_transition(&key.name, current.phase, phase)?;

    // Generation is captured on phase changes only so later edits stay visible
    let observed_generation = if current.phase == phase {
        current.observed_generation
    } else {
        fresh.meta().generation
    };
    let status = OperationStatus {
        phase,
        reason,
        observed_generation,
        ..current
    };
    store.patch_status(&key, &status).await?;
    info!(operation = %key, %phase, "status updated");
    Ok(())
}

/// Persist the claim backing an operation if it is not recorded yet
pub(crate) async fn record_volume_ref<K: OperationResource>(
    store: &dyn ResourceStore<K>,
    resource: &K,
    volume_ref: String,
) -> Result<()> {
    let key = ObjectKey::for_resource(resource)?;
    let Some(fresh) = store.get(&key).await? else {
        return Ok(());
    };

    let current = fresh.operation_status().cloned().unwrap_or_default();
    if current.volume_ref == volume_ref {
        return Ok(());
    }
    let status = OperationStatus {
        volume_ref,
        ..current
    };
    store.patch_status(&key, &status).await
}

/// Reconcile entry point handed to the kube-runtime controller
#[instrument(skip(resource, engine), fields(operation = %resource.name_any()))]
pub async fn reconcile<K, A>(resource: Arc<K>, engine: Arc<Engine<A>>) -> Result<Action>
where
    K: OperationResource,
    A: OperationAdapter,
{
    let key = ObjectKey::for_resource(resource.as_ref())?;
    Ok(engine.reconcile(&key).await?.into_action())
}

/// Requeue failed passes after a short delay
///
/// Only transient errors reach this point; everything else was already
/// recorded as a Failed phase by the engine.
pub fn error_policy<K, A>(resource: Arc<K>, error: &Error, _engine: Arc<Engine<A>>) -> Action
where
    K: OperationResource,
    A: OperationAdapter,
{
    error!(
        ?error,
        operation = %resource.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Run a controller for one operation kind until a shutdown signal
///
/// Worker pods are owned by their operation, so pod readiness changes
/// trigger a pass without waiting for the requeue timer.
pub async fn run_operation_controller<K, A>(client: Client, engine: Arc<Engine<A>>)
where
    K: OperationResource,
    A: OperationAdapter + 'static,
{
    let kind = K::kind(&()).to_string();
    let operations: Api<K> = Api::all(client.clone());
    let workers: Api<Pod> = Api::all(client);
    let worker_selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");

    info!(%kind, "starting controller");
    Controller::new(operations, WatcherConfig::default())
        .owns(workers, WatcherConfig::default().labels(&worker_selector))
        .shutdown_on_signal()
        .run(reconcile::<K, A>, error_policy::<K, A>, engine)
        .for_each(|result| {
            let kind = kind.clone();
            async move {
                match result {
                    Ok(action) => debug!(%kind, ?action, "reconciliation completed"),
                    Err(e) => error!(%kind, error = ?e, "reconciliation error"),
                }
            }
        })
        .await;
    info!(%kind, "controller stopped");
}
