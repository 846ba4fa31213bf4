//! Generic reconciliation engine
//!
//! One [`Engine::reconcile`] call is one pass over one operation resource.
//! The pass reads the persisted phase, does the work that phase calls for
//! and reports when the dispatcher should come back:
//!
//! - **Initializing**: `init` the prerequisites, ensure the worker, wait for
//!   it to be ready, start the remote operation, then move to Running
//! - **Running**: poll the agent (with bounded retries) and move to
//!   Succeeded or Failed once it reports a terminal state
//! - **Succeeded / Failed**: nothing to do
//!
//! Transient errors keep the phase, record the error as `reason` and are
//! returned so the dispatcher retries with backoff. Every other error moves
//! the operation to Failed.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{ObjectKey, OperationAdapter};
use crate::compute::{worker_name, ComputeProvisioner, Readiness, WorkerOutcome};
use crate::crd::OperationPhase;
use crate::events::{actions, reasons, EventPublisher};
use crate::exec::{AgentTarget, ExecutionClient};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Timing knobs for the engine
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Deadline for each remote call (volume creation, invoke, poll)
    pub call_timeout: Duration,
    /// Requeue delay while waiting for the worker to become ready
    pub readiness_interval: Duration,
    /// Requeue delay between polls of a running operation
    pub poll_interval: Duration,
    /// Retries of a transiently failing poll within one pass
    pub poll_retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            readiness_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            poll_retry: RetryConfig {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                ..RetryConfig::with_max_attempts(5)
            },
        }
    }
}

/// What the dispatcher should do after a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing left to do until the resource changes
    Done,
    /// Run another pass after the delay
    Requeue(Duration),
}

impl Outcome {
    /// Convert to a kube-runtime controller action
    pub fn into_action(self) -> Action {
        match self {
            Outcome::Done => Action::await_change(),
            Outcome::Requeue(delay) => Action::requeue(delay),
        }
    }
}

/// Drives operations of one kind through their lifecycle
pub struct Engine<A> {
    adapter: A,
    compute: Arc<dyn ComputeProvisioner>,
    exec: Arc<dyn ExecutionClient>,
    events: Arc<dyn EventPublisher>,
    config: EngineConfig,
    drift_reported: Mutex<HashSet<ObjectKey>>,
}

impl<A: OperationAdapter> Engine<A> {
    /// Create an engine for the kind handled by `adapter`
    pub fn new(
        adapter: A,
        compute: Arc<dyn ComputeProvisioner>,
        exec: Arc<dyn ExecutionClient>,
        events: Arc<dyn EventPublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            adapter,
            compute,
            exec,
            events,
            config,
            drift_reported: Mutex::new(HashSet::new()),
        }
    }

    /// The adapter this engine drives
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Run one reconciliation pass for `key`
    #[instrument(skip_all, fields(kind = self.adapter.kind(), operation = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        let Some(resource) = self.adapter.load(key).await? else {
            debug!("operation no longer exists");
            self.forget(key);
            return Ok(Outcome::Done);
        };

        let phase = self.adapter.current_phase(&resource);
        debug!(%phase, "reconciling operation");

        let result = match phase {
            OperationPhase::Succeeded | OperationPhase::Failed => {
                self.forget(key);
                return Ok(Outcome::Done);
            }
            OperationPhase::Initializing => self.initialize(key, &resource).await,
            OperationPhase::Running => self.track(key, &resource).await,
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_transient() => {
                warn!(%phase, error = %e, "transient failure, will retry");
                // Best effort: the dispatcher retries regardless
                if let Err(write_err) = self.adapter.advance_phase(&resource, phase, Some(&e)).await
                {
                    debug!(error = %write_err, "could not record transient reason");
                }
                Err(e)
            }
            Err(e) => {
                self.fail(&resource, phase, e).await?;
                Ok(Outcome::Done)
            }
        }
    }

    async fn initialize(&self, key: &ObjectKey, resource: &A::Resource) -> Result<Outcome> {
        let spec = self.bounded("init", self.adapter.init(resource)).await?;
        if self.compute.ensure(key, &spec).await? == WorkerOutcome::Created {
            self.events
                .publish(
                    &self.adapter.object_ref(resource),
                    EventType::Normal,
                    reasons::WORKER_CREATED,
                    actions::PROVISION,
                    Some(format!("created worker {}", worker_name(&key.name))),
                )
                .await;
        }

        let endpoint = match self.compute.readiness(key).await? {
            Readiness::Absent | Readiness::Pending => {
                debug!("waiting for worker to become ready");
                self.adapter
                    .advance_phase(resource, OperationPhase::Initializing, None)
                    .await?;
                return Ok(Outcome::Requeue(self.config.readiness_interval));
            }
            Readiness::Terminated(message) => {
                return Err(Error::worker(worker_name(&key.name), message));
            }
            Readiness::Ready { endpoint } => endpoint,
        };

        let target = AgentTarget::new(worker_name(&key.name), endpoint);
        let cluster = self.adapter.target_cluster(resource);
        info!(%cluster, worker = %target.worker, "worker ready, starting remote operation");
        self.bounded(
            "invoke",
            self.adapter.invoke(self.exec.as_ref(), &target, resource),
        )
        .await?;
        self.adapter
            .advance_phase(resource, OperationPhase::Running, None)
            .await?;
        info!(phase = %OperationPhase::Running, "operation started");
        self.events
            .publish(
                &self.adapter.object_ref(resource),
                EventType::Normal,
                reasons::OPERATION_STARTED,
                actions::INVOKE,
                Some(format!("{} of cluster {cluster} started", self.adapter.kind())),
            )
            .await;
        Ok(Outcome::Requeue(self.config.poll_interval))
    }

    async fn track(&self, key: &ObjectKey, resource: &A::Resource) -> Result<Outcome> {
        self.report_spec_drift(key, resource).await;

        let worker = worker_name(&key.name);
        let target = match self.compute.readiness(key).await? {
            Readiness::Ready { endpoint } => AgentTarget::new(&worker, endpoint),
            Readiness::Pending => {
                debug!(%worker, "worker not ready, skipping poll");
                return Ok(Outcome::Requeue(self.config.readiness_interval));
            }
            Readiness::Absent => {
                return Err(Error::worker(worker, "pod disappeared while running"));
            }
            Readiness::Terminated(message) => return Err(Error::worker(worker, message)),
        };

        let polled = retry_with_backoff(
            &self.config.poll_retry,
            "poll",
            |e: &Error| e.is_transient(),
            || {
                self.bounded(
                    "poll",
                    self.adapter.poll(self.exec.as_ref(), &target, resource),
                )
            },
        )
        .await;

        let phase = match polled {
            Ok(phase) => phase,
            Err(e) if e.is_transient() => {
                return Err(Error::exhausted(
                    "poll",
                    self.config.poll_retry.max_attempts,
                    e.to_string(),
                ));
            }
            Err(e) => return Err(e),
        };

        match phase {
            OperationPhase::Running | OperationPhase::Initializing => {
                debug!("remote operation still running");
                self.adapter
                    .advance_phase(resource, OperationPhase::Running, None)
                    .await?;
                Ok(Outcome::Requeue(self.config.poll_interval))
            }
            OperationPhase::Succeeded => {
                self.adapter
                    .advance_phase(resource, OperationPhase::Succeeded, None)
                    .await?;
                info!(phase = %OperationPhase::Succeeded, "operation succeeded");
                self.events
                    .publish(
                        &self.adapter.object_ref(resource),
                        EventType::Normal,
                        reasons::OPERATION_SUCCEEDED,
                        actions::POLL,
                        None,
                    )
                    .await;
                Ok(Outcome::Done)
            }
            OperationPhase::Failed => Err(Error::remote_failure(&key.name)),
        }
    }

    /// Warn about an edited spec once per operation
    async fn report_spec_drift(&self, key: &ObjectKey, resource: &A::Resource) {
        if !self.adapter.spec_changed(resource) {
            return;
        }
        let first = match self.drift_reported.lock() {
            Ok(mut reported) => reported.insert(key.clone()),
            Err(_) => false,
        };
        if !first {
            return;
        }
        warn!("spec changed after the operation started; the change is ignored");
        self.events
            .publish(
                &self.adapter.object_ref(resource),
                EventType::Warning,
                reasons::SPEC_CHANGED,
                actions::POLL,
                Some("operations cannot be modified once started".to_string()),
            )
            .await;
    }

    fn forget(&self, key: &ObjectKey) {
        if let Ok(mut reported) = self.drift_reported.lock() {
            reported.remove(key);
        }
    }

    async fn fail(&self, resource: &A::Resource, from: OperationPhase, error: Error) -> Result<()> {
        warn!(%from, configuration = error.is_configuration(), error = %error, "operation failed");
        self.adapter
            .advance_phase(resource, OperationPhase::Failed, Some(&error))
            .await?;
        self.events
            .publish(
                &self.adapter.object_ref(resource),
                EventType::Warning,
                reasons::OPERATION_FAILED,
                if from == OperationPhase::Initializing {
                    actions::PROVISION
                } else {
                    actions::POLL
                },
                Some(error.to_string()),
            )
            .await;
        Ok(())
    }

    async fn bounded<T>(&self, call: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(call, self.config.call_timeout)),
        }
    }
}
