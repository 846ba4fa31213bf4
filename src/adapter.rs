//! The operation adapter contract
//!
//! An adapter teaches the generic [`Engine`](crate::engine::Engine) how to
//! drive one kind of operation resource. The engine holds no kind-specific
//! logic; everything it knows about backups, restores or any future kind
//! flows through this trait.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::ResourceExt;

use crate::compute::ComputeSpec;
use crate::crd::OperationPhase;
use crate::exec::{AgentTarget, ExecutionClient};
use crate::{Error, Result};

/// Identity of an operation resource
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace of the resource
    pub namespace: String,
    /// Name of the resource
    pub name: String,
}

impl ObjectKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the key of a namespaced kube resource
    pub fn for_resource<K: ResourceExt>(resource: &K) -> Result<Self> {
        let namespace = resource.namespace().ok_or_else(|| {
            Error::internal_with_context(
                "object-key",
                format!("{} has no namespace", resource.name_any()),
            )
        })?;
        Ok(Self::new(namespace, resource.name_any()))
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Per-kind logic consumed by the engine
///
/// Every write an adapter performs must be idempotent: the engine may call
/// any method again after a crash or a transient error.
#[async_trait]
pub trait OperationAdapter: Send + Sync {
    /// The operation resource type
    type Resource: Send + Sync;

    /// Kind name used in logs
    fn kind(&self) -> &'static str;

    /// Fetch the current resource with defaults applied
    ///
    /// Returns `Ok(None)` when the resource no longer exists.
    async fn load(&self, key: &ObjectKey) -> Result<Option<Self::Resource>>;

    /// Cluster the operation acts against, used for labels and logs
    fn target_cluster(&self, resource: &Self::Resource) -> String;

    /// Last persisted phase
    fn current_phase(&self, resource: &Self::Resource) -> OperationPhase;

    /// Reference used when publishing events about the resource
    fn object_ref(&self, resource: &Self::Resource) -> ObjectReference;

    /// True if the spec was edited after the last status write
    fn spec_changed(&self, _resource: &Self::Resource) -> bool {
        false
    }

    /// Persist a phase and its reason
    ///
    /// Re-reads the resource before writing and performs no write when
    /// phase and reason already match.
    async fn advance_phase(
        &self,
        resource: &Self::Resource,
        phase: OperationPhase,
        reason: Option<&Error>,
    ) -> Result<()>;

    /// Ensure prerequisites (the volume) and describe the worker to run
    async fn init(&self, resource: &Self::Resource) -> Result<ComputeSpec>;

    /// Ask the worker's agent to start the operation
    async fn invoke(
        &self,
        exec: &dyn ExecutionClient,
        target: &AgentTarget,
        resource: &Self::Resource,
    ) -> Result<()>;

    /// Ask the worker's agent how the operation is doing
    async fn poll(
        &self,
        exec: &dyn ExecutionClient,
        target: &AgentTarget,
        resource: &Self::Resource,
    ) -> Result<OperationPhase>;
}
