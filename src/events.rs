//! Kubernetes Events for operation resources
//!
//! Phase changes are mirrored as Events so `kubectl describe backup <name>`
//! shows the operation's history next to its status.
//!
//! Publishing is fire-and-forget: failures are logged and swallowed, and a
//! lost event never fails a reconciliation pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about operation resources
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`
    ///
    /// `reason` and `action` should come from [`reasons`] and [`actions`].
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the kube-runtime `Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                object = resource_ref.name.as_deref().unwrap_or_default(),
                error = %e,
                "failed to publish event"
            );
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (the REASON column of `kubectl get events`)
pub mod reasons {
    /// Worker pod created
    pub const WORKER_CREATED: &str = "WorkerCreated";
    /// Agent accepted the operation
    pub const OPERATION_STARTED: &str = "OperationStarted";
    /// Agent reported success
    pub const OPERATION_SUCCEEDED: &str = "OperationSucceeded";
    /// Operation moved to Failed
    pub const OPERATION_FAILED: &str = "OperationFailed";
    /// Spec was edited after the operation started
    pub const SPEC_CHANGED: &str = "SpecChangedWhileRunning";
}

/// Event actions (the ACTION column of `kubectl get events`)
pub mod actions {
    /// Provisioning the volume and worker
    pub const PROVISION: &str = "Provision";
    /// Starting the remote operation
    pub const INVOKE: &str = "Invoke";
    /// Checking remote progress
    pub const POLL: &str = "Poll";
}
