//! End-to-end reconciliation scenarios against in-memory collaborators
//!
//! Every collaborator the engine talks to (resource store, claims, worker
//! pods, the agent) is replaced by a small fake so whole operation
//! lifecycles can be driven pass by pass without a cluster.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;

use oneshot::adapter::ObjectKey;
use oneshot::compute::{ComputeProvisioner, ComputeSpec, Readiness, WorkerOutcome};
use oneshot::controller::{BackupAdapter, ResourceStore, RestoreAdapter};
use oneshot::crd::{
    Backup, BackupSpec, OperationPhase, OperationResource, OperationStatus, Restore, RestoreSpec,
    VolumeSpec,
};
use oneshot::engine::{Engine, EngineConfig, Outcome};
use oneshot::events::NoopEventPublisher;
use oneshot::exec::{AgentTarget, ExecutionClient, OperationRequest, RemoteState};
use oneshot::retry::RetryConfig;
use oneshot::storage::{StorageConfig, StorageProvisioner, VolumeClient};
use oneshot::{Error, Result};

// =============================================================================
// Fakes
// =============================================================================

struct MemStore<K> {
    objects: Mutex<HashMap<ObjectKey, K>>,
    writes: AtomicUsize,
    fail_next_write: AtomicBool,
    set_status: fn(&mut K, OperationStatus),
}

impl<K: OperationResource> MemStore<K> {
    fn new(set_status: fn(&mut K, OperationStatus)) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            fail_next_write: AtomicBool::new(false),
            set_status,
        })
    }

    fn insert(&self, resource: K) {
        let key = ObjectKey::for_resource(&resource).unwrap();
        self.objects.lock().unwrap().insert(key, resource);
    }

    fn delete(&self, key: &ObjectKey) {
        self.objects.lock().unwrap().remove(key);
    }

    fn status(&self, key: &ObjectKey) -> OperationStatus {
        self.objects.lock().unwrap()[key]
            .operation_status()
            .cloned()
            .unwrap_or_default()
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Drop the next status write as if the connection broke mid-request
    fn break_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<K: OperationResource> ResourceStore<K> for MemStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn patch_status(&self, key: &ObjectKey, status: &OperationStatus) -> Result<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(Error::transport("kube-apiserver", "connection reset"));
        }
        let mut objects = self.objects.lock().unwrap();
        let resource = objects
            .get_mut(key)
            .ok_or_else(|| Error::internal_with_context("store", format!("{key} not found")))?;
        (self.set_status)(resource, status.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Cloning shares the underlying claims
#[derive(Clone, Default)]
struct MemVolumes {
    claims: Arc<Mutex<HashMap<String, PersistentVolumeClaim>>>,
}

impl MemVolumes {
    fn requested_size(&self, name: &str) -> Option<String> {
        let claims = self.claims.lock().unwrap();
        let claim = claims.get(name)?;
        let requests = claim.spec.as_ref()?.resources.as_ref()?.requests.as_ref()?;
        Some(requests.get("storage")?.0.clone())
    }

    fn count(&self) -> usize {
        self.claims.lock().unwrap().len()
    }
}

#[async_trait]
impl VolumeClient for MemVolumes {
    async fn get_claim(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claims.lock().unwrap().get(name).cloned())
    }

    async fn create_claim(&self, _namespace: &str, claim: &PersistentVolumeClaim) -> Result<()> {
        let name = claim.metadata.name.clone().unwrap_or_default();
        self.claims.lock().unwrap().insert(name, claim.clone());
        Ok(())
    }
}

const WORKER_IP: &str = "10.42.0.17";

#[derive(Default)]
struct FakeCompute {
    ready: AtomicBool,
    lost: AtomicBool,
    specs: Mutex<Vec<ComputeSpec>>,
}

#[async_trait]
impl ComputeProvisioner for FakeCompute {
    async fn ensure(&self, _key: &ObjectKey, spec: &ComputeSpec) -> Result<WorkerOutcome> {
        let mut specs = self.specs.lock().unwrap();
        specs.push(spec.clone());
        Ok(if specs.len() == 1 {
            WorkerOutcome::Created
        } else {
            WorkerOutcome::Existing
        })
    }

    async fn readiness(&self, _key: &ObjectKey) -> Result<Readiness> {
        Ok(if self.lost.load(Ordering::SeqCst) {
            Readiness::Absent
        } else if self.ready.load(Ordering::SeqCst) {
            Readiness::Ready {
                endpoint: WORKER_IP.to_string(),
            }
        } else {
            Readiness::Pending
        })
    }
}

#[derive(Default)]
struct FakeAgent {
    invocations: Mutex<Vec<(AgentTarget, String, OperationRequest)>>,
    rejection: Mutex<Option<(u16, String)>>,
    states: Mutex<VecDeque<RemoteState>>,
    status_calls: AtomicUsize,
}

impl FakeAgent {
    fn script(&self, states: &[RemoteState]) {
        self.states.lock().unwrap().extend(states.iter().copied());
    }

    fn reject_start(&self, status: u16, body: &str) {
        *self.rejection.lock().unwrap() = Some((status, body.to_string()));
    }

    fn invocations(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    fn remote_calls(&self) -> usize {
        self.invocations() + self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionClient for FakeAgent {
    async fn invoke(
        &self,
        target: &AgentTarget,
        name: &str,
        request: &OperationRequest,
    ) -> Result<()> {
        self.invocations
            .lock()
            .unwrap()
            .push((target.clone(), name.to_string(), request.clone()));
        match self.rejection.lock().unwrap().clone() {
            Some((status, body)) => Err(Error::Remote {
                call: "start".to_string(),
                status,
                message: body,
            }),
            None => Ok(()),
        }
    }

    async fn status(&self, _target: &AgentTarget, _name: &str) -> Result<RemoteState> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut states = self.states.lock().unwrap();
        Ok(match states.len() {
            0 => RemoteState::Running,
            1 => states[0],
            _ => states.pop_front().unwrap_or(RemoteState::Running),
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    backups: Arc<MemStore<Backup>>,
    volumes: MemVolumes,
    compute: Arc<FakeCompute>,
    agent: Arc<FakeAgent>,
    engine: Engine<BackupAdapter<MemVolumes>>,
}

fn config() -> EngineConfig {
    EngineConfig {
        call_timeout: Duration::from_secs(5),
        readiness_interval: Duration::from_secs(5),
        poll_interval: Duration::from_secs(10),
        poll_retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        },
    }
}

fn backup(name: &str, storage: Option<&str>) -> Backup {
    let mut backup = Backup::new(
        name,
        BackupSpec {
            cluster: "infinispan".to_string(),
            volume: storage.map(|s| VolumeSpec {
                storage: Some(s.to_string()),
                storage_class_name: None,
            }),
            container: None,
            resources: None,
        },
    );
    backup.metadata.namespace = Some("data".to_string());
    backup.metadata.uid = Some(format!("uid-{name}"));
    backup.metadata.generation = Some(1);
    backup
}

impl Harness {
    fn new() -> Self {
        let backups = MemStore::new(|b: &mut Backup, s| b.status = Some(s));
        let volumes = MemVolumes::default();
        let compute = Arc::new(FakeCompute::default());
        let agent = Arc::new(FakeAgent::default());
        let storage = StorageProvisioner::new(volumes.clone(), StorageConfig::default()).unwrap();
        let engine = Engine::new(
            BackupAdapter::new(backups.clone(), storage),
            compute.clone(),
            agent.clone(),
            Arc::new(NoopEventPublisher),
            config(),
        );
        Self {
            backups,
            volumes,
            compute,
            agent,
            engine,
        }
    }

    async fn pass(&self, key: &ObjectKey) -> Outcome {
        self.engine.reconcile(key).await.unwrap()
    }

    fn phase(&self, key: &ObjectKey) -> OperationPhase {
        self.backups.status(key).phase
    }
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new("data", name)
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn default_sized_claim_then_running_once_worker_is_ready() {
    let h = Harness::new();
    h.backups.insert(backup("nightly", None));
    let k = key("nightly");

    assert_eq!(h.pass(&k).await, Outcome::Requeue(config().readiness_interval));
    assert_eq!(h.volumes.requested_size("nightly").as_deref(), Some("1Gi"));
    assert_eq!(h.phase(&k), OperationPhase::Initializing);
    assert_eq!(h.backups.status(&k).volume_ref, "pvc/nightly");
    assert_eq!(h.agent.invocations(), 0);

    h.compute.ready.store(true, Ordering::SeqCst);
    assert_eq!(h.pass(&k).await, Outcome::Requeue(config().poll_interval));
    assert_eq!(h.phase(&k), OperationPhase::Running);
    assert_eq!(h.agent.invocations(), 1);
    assert_eq!(h.volumes.count(), 1);

    let specs = h.compute.specs.lock().unwrap();
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0], specs[1]);
}

#[tokio::test]
async fn running_backup_succeeds_after_two_polls() {
    let h = Harness::new();
    h.backups.insert(backup("nightly", None));
    h.compute.ready.store(true, Ordering::SeqCst);
    h.agent
        .script(&[RemoteState::Running, RemoteState::Succeeded]);
    let k = key("nightly");

    h.pass(&k).await;
    assert_eq!(h.phase(&k), OperationPhase::Running);

    assert_eq!(h.pass(&k).await, Outcome::Requeue(config().poll_interval));
    assert_eq!(h.phase(&k), OperationPhase::Running);

    assert_eq!(h.pass(&k).await, Outcome::Done);
    let status = h.backups.status(&k);
    assert_eq!(status.phase, OperationPhase::Succeeded);
    assert!(status.reason.is_empty());
    assert_eq!(h.agent.invocations(), 1);

    let (target, name, request) = h.agent.invocations.lock().unwrap()[0].clone();
    assert_eq!(target, AgentTarget::new("nightly-worker", WORKER_IP));
    assert_eq!(name, "nightly");
    assert_eq!(request.directory, oneshot::DATA_MOUNT_PATH);
}

#[tokio::test]
async fn invalid_size_fails_immediately_without_a_claim() {
    let h = Harness::new();
    h.backups.insert(backup("nightly", Some("abc")));
    let k = key("nightly");

    assert_eq!(h.pass(&k).await, Outcome::Done);
    let status = h.backups.status(&k);
    assert_eq!(status.phase, OperationPhase::Failed);
    assert!(status.reason.contains("abc"), "reason: {}", status.reason);
    assert!(status.reason.contains("regular expression"));
    assert_eq!(h.volumes.count(), 0);
    assert!(h.compute.specs.lock().unwrap().is_empty());

    // Not retried
    assert_eq!(h.pass(&k).await, Outcome::Done);
    assert_eq!(h.backups.status(&k).phase, OperationPhase::Failed);
}

#[tokio::test]
async fn deleted_while_running_makes_no_remote_calls() {
    let h = Harness::new();
    h.backups.insert(backup("nightly", None));
    h.compute.ready.store(true, Ordering::SeqCst);
    let k = key("nightly");

    h.pass(&k).await;
    assert_eq!(h.phase(&k), OperationPhase::Running);
    let calls = h.agent.remote_calls();

    h.backups.delete(&k);
    assert_eq!(h.pass(&k).await, Outcome::Done);
    assert_eq!(h.agent.remote_calls(), calls);
}

#[tokio::test]
async fn finished_operation_is_never_rewritten() {
    let h = Harness::new();
    h.backups.insert(backup("nightly", None));
    h.compute.ready.store(true, Ordering::SeqCst);
    h.agent.script(&[RemoteState::Succeeded]);
    let k = key("nightly");

    h.pass(&k).await;
    h.pass(&k).await;
    assert_eq!(h.phase(&k), OperationPhase::Succeeded);

    let writes = h.backups.writes();
    let calls = h.agent.remote_calls();
    for _ in 0..3 {
        assert_eq!(h.pass(&k).await, Outcome::Done);
    }
    assert_eq!(h.backups.writes(), writes);
    assert_eq!(h.agent.remote_calls(), calls);
}

#[tokio::test]
async fn agent_reported_failure_is_terminal() {
    let h = Harness::new();
    h.backups.insert(backup("nightly", None));
    h.compute.ready.store(true, Ordering::SeqCst);
    h.agent.script(&[RemoteState::Failed]);
    let k = key("nightly");

    h.pass(&k).await;
    assert_eq!(h.pass(&k).await, Outcome::Done);
    let status = h.backups.status(&k);
    assert_eq!(status.phase, OperationPhase::Failed);
    assert!(!status.reason.is_empty());
}

#[tokio::test]
async fn restore_waits_for_backup_then_mounts_its_claim() {
    let h = Harness::new();
    h.backups.insert(backup("nightly", None));
    h.compute.ready.store(true, Ordering::SeqCst);

    let restores = MemStore::new(|r: &mut Restore, s| r.status = Some(s));
    let mut restore = Restore::new(
        "replay",
        RestoreSpec {
            cluster: "infinispan".to_string(),
            backup: "nightly".to_string(),
            container: None,
            resources: None,
        },
    );
    restore.metadata.namespace = Some("data".to_string());
    restore.metadata.uid = Some("uid-replay".to_string());
    restores.insert(restore);

    let restore_engine = Engine::new(
        RestoreAdapter::new(restores.clone(), h.backups.clone()),
        h.compute.clone(),
        h.agent.clone(),
        Arc::new(NoopEventPublisher),
        config(),
    );
    let rk = key("replay");

    // Backup still Initializing: restore waits without failing
    let err = restore_engine.reconcile(&rk).await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(restores.status(&rk).phase, OperationPhase::Initializing);

    h.agent.script(&[RemoteState::Succeeded]);
    h.pass(&key("nightly")).await;
    h.pass(&key("nightly")).await;
    assert_eq!(h.phase(&key("nightly")), OperationPhase::Succeeded);

    assert_eq!(
        restore_engine.reconcile(&rk).await.unwrap(),
        Outcome::Requeue(config().poll_interval)
    );
    let status = restores.status(&rk);
    assert_eq!(status.phase, OperationPhase::Running);
    assert!(status.reason.is_empty());
    assert_eq!(status.volume_ref, "pvc/nightly");
    assert_eq!(h.volumes.count(), 1);

    let last = h.compute.specs.lock().unwrap().last().cloned().unwrap();
    assert!(last.volume.read_only);
    assert_eq!(last.volume.source.claim_name(), Some("nightly"));
}

#[tokio::test]
async fn rejected_start_fails_with_agent_message() {
    let h = Harness::new();
    h.backups.insert(backup("nightly", None));
    h.compute.ready.store(true, Ordering::SeqCst);
    h.agent
        .reject_start(400, "unknown resource type \"widgets\"");
    let k = key("nightly");

    assert_eq!(h.pass(&k).await, Outcome::Done);
    let status = h.backups.status(&k);
    assert_eq!(status.phase, OperationPhase::Failed);
    assert!(status.reason.contains("400"), "reason: {}", status.reason);
    assert!(status.reason.contains("unknown resource type"));
    assert_eq!(h.agent.invocations(), 1);

    // Not retried
    assert_eq!(h.pass(&k).await, Outcome::Done);
    assert_eq!(h.agent.invocations(), 1);
}

#[tokio::test]
async fn lost_running_write_reinvokes_and_accepts_duplicate() {
    let h = Harness::new();
    h.backups.insert(backup("nightly", None));
    let k = key("nightly");

    assert_eq!(h.pass(&k).await, Outcome::Requeue(config().readiness_interval));

    // The start is accepted but the Running write never lands
    h.compute.ready.store(true, Ordering::SeqCst);
    h.backups.break_next_write();
    let err = h.engine.reconcile(&k).await.unwrap_err();
    assert!(err.is_transient());
    let status = h.backups.status(&k);
    assert_eq!(status.phase, OperationPhase::Initializing);
    assert!(status.reason.contains("connection reset"));
    assert_eq!(h.agent.invocations(), 1);

    // The next pass starts again and the agent acknowledges the duplicate
    assert_eq!(h.pass(&k).await, Outcome::Requeue(config().poll_interval));
    let status = h.backups.status(&k);
    assert_eq!(status.phase, OperationPhase::Running);
    assert!(status.reason.is_empty());
    assert_eq!(h.agent.invocations(), 2);
}

#[tokio::test]
async fn worker_lost_while_running_fails_the_backup() {
    let h = Harness::new();
    h.backups.insert(backup("nightly", None));
    h.compute.ready.store(true, Ordering::SeqCst);
    let k = key("nightly");

    h.pass(&k).await;
    assert_eq!(h.phase(&k), OperationPhase::Running);
    let polls = h.agent.remote_calls();

    h.compute.lost.store(true, Ordering::SeqCst);
    assert_eq!(h.pass(&k).await, Outcome::Done);
    let status = h.backups.status(&k);
    assert_eq!(status.phase, OperationPhase::Failed);
    assert!(status.reason.contains("nightly-worker"));
    assert_eq!(h.agent.remote_calls(), polls);
}
